//! Opaque byte storage for mask images and the RLE index document.

use async_trait::async_trait;
use dive_core::types::{AnnotationId, DbId, Frame};

use crate::error::StoreError;

pub mod local;
pub mod memory;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

/// File name of a dataset's aggregate RLE index.
pub const RLE_INDEX_FILE: &str = "RLE_masks.json";

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns `false` when nothing was stored under `key`.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Prefix under which every blob of a dataset lives.
pub fn dataset_prefix(dataset_id: DbId) -> String {
    format!("datasets/{dataset_id}")
}

/// Key of the dataset's RLE index document.
pub fn rle_index_key(dataset_id: DbId) -> String {
    format!("{}/masks/{RLE_INDEX_FILE}", dataset_prefix(dataset_id))
}

/// A fresh key for one frame's mask image. Every upload gets its own key so
/// a replacement never overwrites bytes another reader may still hold.
pub fn mask_blob_key(dataset_id: DbId, track_id: AnnotationId, frame_id: Frame) -> String {
    format!(
        "{}/masks/{track_id}/{frame_id}-{}.png",
        dataset_prefix(dataset_id),
        uuid::Uuid::new_v4().simple()
    )
}
