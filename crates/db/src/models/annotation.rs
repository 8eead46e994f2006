//! Versioned annotation rows shared by `annotation_tracks` and
//! `annotation_groups`.

use dive_core::annotation::{AnnotationKind, Group, Track};
use dive_core::revision::{Liveness, StoredAnnotation};
use dive_core::types::{AnnotationId, DbId, Revision, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// Maps an annotation kind onto its backing table.
pub trait AnnotationTable: AnnotationKind {
    const TABLE: &'static str;
}

impl AnnotationTable for Track {
    const TABLE: &'static str = "annotation_tracks";
}

impl AnnotationTable for Group {
    const TABLE: &'static str = "annotation_groups";
}

/// A row from `annotation_tracks` or `annotation_groups`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AnnotationRow {
    pub id: DbId,
    pub dataset_id: DbId,
    pub annotation_id: AnnotationId,
    pub rev_created: Revision,
    pub rev_deleted: Option<Revision>,
    pub body: serde_json::Value,
    pub created_at: Timestamp,
}

impl AnnotationRow {
    pub fn liveness(&self) -> Liveness {
        Liveness::from_columns(self.rev_created, self.rev_deleted)
    }

    /// Decode the JSONB body into its typed annotation.
    pub fn into_stored<K: AnnotationKind>(self) -> Result<StoredAnnotation<K>, serde_json::Error> {
        let liveness = self.liveness();
        let annotation: K = serde_json::from_value(self.body)?;
        Ok(StoredAnnotation {
            dataset_id: self.dataset_id,
            liveness,
            annotation,
        })
    }
}
