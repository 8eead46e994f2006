#![allow(dead_code)]

use std::sync::Arc;

use dive_core::annotation::{ConfidencePair, Feature, Track};
use dive_core::mask::encode_mask_png;
use dive_core::rle::BinaryMask;
use dive_core::types::{AnnotationId, DbId, Frame};
use dive_engine::blob::{BlobStore, MemoryBlobStore};
use dive_engine::config::EngineConfig;
use async_trait::async_trait;
use dive_core::annotation::AnnotationKind;
use dive_core::labels::TrackLabel;
use dive_core::revision::{RecordFilter, RecordQuery, StoredAnnotation};
use dive_core::types::Revision;
use dive_db::models::annotation::AnnotationTable;
use dive_db::models::dataset::{CreateDataset, Dataset};
use dive_db::models::mask_item::MaskFrameItem;
use dive_db::models::revision::{CreateRevisionLogEntry, RevisionLogEntry};
use dive_engine::error::StoreError;
use dive_engine::store::memory::MemoryStore;
use dive_engine::store::{
    BulkWriteResult, DatasetStore, MaskItemStore, OpOutcome, RecordStore, RevisionLease,
    RevisionStore, WriteOp,
};
use dive_engine::Engine;

/// Engine over the memory backends, plus handles on its stores.
pub struct TestEngine {
    pub engine: Engine<MemoryStore>,
    pub store: MemoryStore,
    pub blobs: MemoryBlobStore,
}

pub fn test_engine() -> TestEngine {
    let store = MemoryStore::new();
    let blobs = MemoryBlobStore::new();
    let shared: Arc<dyn BlobStore> = Arc::new(blobs.clone());
    let engine = Engine::new(store.clone(), shared, &EngineConfig::embedded("unused"));
    TestEngine {
        engine,
        store,
        blobs,
    }
}

pub async fn new_dataset(t: &TestEngine) -> DbId {
    t.engine
        .datasets
        .create_dataset("test dataset", None)
        .await
        .unwrap()
        .id
}

/// A track with one keyframe per given frame.
pub fn track(id: AnnotationId, frames: &[Frame]) -> Track {
    let features = frames
        .iter()
        .map(|&f| Feature::new(f, [f, f, f + 10, f + 10]))
        .collect();
    Track::from_features(id, vec![], features)
}

pub fn labeled_track(id: AnnotationId, label: &str, confidence: f64) -> Track {
    let mut t = track(id, &[0]);
    t.confidence_pairs = vec![ConfidencePair::new(label, confidence)];
    t
}

pub fn solid_png(height: u32, width: u32) -> Vec<u8> {
    encode_mask_png(&BinaryMask::filled(height, width, true)).unwrap()
}

/// A PNG with only the top-left cell set.
pub fn corner_png(height: u32, width: u32) -> Vec<u8> {
    let mut mask = BinaryMask::filled(height, width, false);
    mask.set(0, 0, true);
    encode_mask_png(&mask).unwrap()
}

// ---------------------------------------------------------------------------
// Failing backend
// ---------------------------------------------------------------------------

/// A memory store whose bulk writes fail every insert of one annotation id
/// with a conflict, while the rest of the batch still lands.
#[derive(Clone)]
pub struct RejectingStore {
    pub inner: MemoryStore,
    pub reject_id: AnnotationId,
}

pub fn rejecting_engine(reject_id: AnnotationId) -> (Engine<RejectingStore>, RejectingStore) {
    let store = RejectingStore {
        inner: MemoryStore::new(),
        reject_id,
    };
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let engine = Engine::new(store.clone(), blobs, &EngineConfig::embedded("unused"));
    (engine, store)
}

#[async_trait]
impl RecordStore for RejectingStore {
    async fn find<K: AnnotationTable>(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<StoredAnnotation<K>>, StoreError> {
        self.inner.find::<K>(query).await
    }

    async fn count<K: AnnotationTable>(&self, filter: &RecordFilter) -> Result<i64, StoreError> {
        self.inner.count::<K>(filter).await
    }

    async fn max_rev_created<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
    ) -> Result<Revision, StoreError> {
        self.inner.max_rev_created::<K>(dataset_id).await
    }

    async fn bulk_write<K: AnnotationTable>(
        &self,
        ops: Vec<WriteOp<K>>,
    ) -> Result<BulkWriteResult, StoreError> {
        let mut outcomes = Vec::new();
        for (index, op) in ops.into_iter().enumerate() {
            if let WriteOp::InsertOne { annotation, .. } = &op {
                if annotation.id() == self.reject_id {
                    let error = StoreError::Conflict(format!("id {} rejected", self.reject_id));
                    outcomes.push((index, Err(error)));
                    continue;
                }
            }
            let mut result = self.inner.bulk_write(vec![op]).await?;
            let outcome = match result.failures.pop() {
                Some(failure) => Err(failure.error),
                None if result.inserted > 0 => Ok(OpOutcome::Inserted),
                None if result.deleted > 0 => Ok(OpOutcome::Deleted(result.deleted)),
                None => Ok(OpOutcome::Modified(result.modified)),
            };
            outcomes.push((index, outcome));
        }
        Ok(BulkWriteResult::from_outcomes(outcomes))
    }
}

#[async_trait]
impl RevisionStore for RejectingStore {
    async fn head(&self, dataset_id: DbId) -> Result<Revision, StoreError> {
        self.inner.head(dataset_id).await
    }

    async fn acquire_lease(&self, dataset_id: DbId) -> Result<Box<dyn RevisionLease>, StoreError> {
        self.inner.acquire_lease(dataset_id).await
    }

    async fn append_revision(
        &self,
        entry: &CreateRevisionLogEntry,
    ) -> Result<RevisionLogEntry, StoreError> {
        self.inner.append_revision(entry).await
    }

    async fn list_revisions(
        &self,
        dataset_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RevisionLogEntry>, StoreError> {
        self.inner.list_revisions(dataset_id, limit, offset).await
    }

    async fn count_revisions(&self, dataset_id: DbId) -> Result<i64, StoreError> {
        self.inner.count_revisions(dataset_id).await
    }

    async fn truncate_revisions(
        &self,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<u64, StoreError> {
        self.inner.truncate_revisions(dataset_id, revision).await
    }
}

#[async_trait]
impl MaskItemStore for RejectingStore {
    async fn find_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError> {
        self.inner.find_mask_item(dataset_id, track_id, frame_id).await
    }

    async fn list_mask_items(
        &self,
        dataset_id: DbId,
        track_id: Option<AnnotationId>,
    ) -> Result<Vec<MaskFrameItem>, StoreError> {
        self.inner.list_mask_items(dataset_id, track_id).await
    }

    async fn get_or_create_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<(MaskFrameItem, Option<String>), StoreError> {
        self.inner
            .get_or_create_mask_item(dataset_id, track_id, frame_id)
            .await
    }

    async fn set_mask_blob(&self, item_id: DbId, blob_key: &str) -> Result<MaskFrameItem, StoreError> {
        self.inner.set_mask_blob(item_id, blob_key).await
    }

    async fn delete_mask_frame(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError> {
        self.inner.delete_mask_frame(dataset_id, track_id, frame_id).await
    }

    async fn delete_mask_track(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
    ) -> Result<Vec<MaskFrameItem>, StoreError> {
        self.inner.delete_mask_track(dataset_id, track_id).await
    }

    async fn delete_mask_items(&self, dataset_id: DbId) -> Result<Vec<MaskFrameItem>, StoreError> {
        self.inner.delete_mask_items(dataset_id).await
    }
}

#[async_trait]
impl DatasetStore for RejectingStore {
    async fn create_dataset(&self, input: &CreateDataset) -> Result<Dataset, StoreError> {
        self.inner.create_dataset(input).await
    }

    async fn find_dataset(&self, id: DbId) -> Result<Option<Dataset>, StoreError> {
        self.inner.find_dataset(id).await
    }

    async fn delete_dataset(&self, id: DbId) -> Result<bool, StoreError> {
        self.inner.delete_dataset(id).await
    }

    async fn track_labels(&self, dataset_ids: Option<&[DbId]>) -> Result<Vec<TrackLabel>, StoreError> {
        self.inner.track_labels(dataset_ids).await
    }
}
