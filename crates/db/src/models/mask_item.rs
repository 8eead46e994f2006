//! Mask frame item model.

use dive_core::mask::{mask_file_name, MaskPair};
use dive_core::types::{AnnotationId, DbId, Frame, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `mask_items` table: one stored mask image per
/// (dataset, track, frame).
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct MaskFrameItem {
    pub id: DbId,
    pub dataset_id: DbId,
    pub track_id: AnnotationId,
    pub frame_id: Frame,
    /// `None` until image bytes have been written.
    pub blob_key: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl MaskFrameItem {
    pub fn pair(&self) -> MaskPair {
        MaskPair::new(self.track_id, self.frame_id)
    }

    pub fn file_name(&self) -> String {
        mask_file_name(self.frame_id)
    }
}
