//! Storage seams for the engine.
//!
//! The services talk to storage only through these traits. [`pg::PgStore`]
//! backs them with PostgreSQL; [`memory::MemoryStore`] keeps everything in
//! process for tests and embedded use.

use async_trait::async_trait;
use dive_core::error::CoreError;
use dive_core::labels::TrackLabel;
use dive_core::revision::{RecordFilter, RecordQuery, StoredAnnotation};
use dive_core::types::{AnnotationId, DbId, Frame, Revision};
use dive_db::models::annotation::AnnotationTable;
use dive_db::models::dataset::{CreateDataset, Dataset};
use dive_db::models::mask_item::MaskFrameItem;
use dive_db::models::revision::{CreateRevisionLogEntry, RevisionLogEntry};

use crate::error::StoreError;

pub mod memory;
pub mod pg;

// ---------------------------------------------------------------------------
// Bulk writes
// ---------------------------------------------------------------------------

/// One operation of a bulk write against a record collection.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp<K> {
    /// Insert a new record created at `revision`.
    InsertOne {
        dataset_id: DbId,
        revision: Revision,
        annotation: K,
    },
    /// Set `rev_deleted = revision` on every undeleted match.
    SoftDeleteMany {
        filter: RecordFilter,
        revision: Revision,
    },
    /// Clear `rev_deleted` on every deleted match.
    RestoreMany { filter: RecordFilter },
    /// Physically remove every match.
    DeleteMany { filter: RecordFilter },
}

impl<K> WriteOp<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::InsertOne { .. } => "insert_one",
            WriteOp::SoftDeleteMany { .. } => "soft_delete_many",
            WriteOp::RestoreMany { .. } => "restore_many",
            WriteOp::DeleteMany { .. } => "delete_many",
        }
    }
}

/// What a single successful operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Inserted,
    Modified(u64),
    Deleted(u64),
}

/// A failed operation, by its position in the submitted batch.
#[derive(Debug)]
pub struct WriteFailure {
    pub index: usize,
    pub error: StoreError,
}

/// Totals for a bulk write. Failed operations do not abort their siblings.
#[derive(Debug, Default)]
pub struct BulkWriteResult {
    pub inserted: u64,
    pub modified: u64,
    pub deleted: u64,
    pub failures: Vec<WriteFailure>,
}

impl BulkWriteResult {
    /// Fold per-operation results, in any order, into totals.
    pub fn from_outcomes(
        outcomes: impl IntoIterator<Item = (usize, Result<OpOutcome, StoreError>)>,
    ) -> Self {
        let mut result = Self::default();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(OpOutcome::Inserted) => result.inserted += 1,
                Ok(OpOutcome::Modified(n)) => result.modified += n,
                Ok(OpOutcome::Deleted(n)) => result.deleted += n,
                Err(error) => result.failures.push(WriteFailure { index, error }),
            }
        }
        result.failures.sort_by_key(|f| f.index);
        result
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Shape-check every insert before anything is written, so an invalid batch
/// is never partially applied.
pub(crate) fn validate_inserts<K: AnnotationTable>(ops: &[WriteOp<K>]) -> Result<(), CoreError> {
    for op in ops {
        if let WriteOp::InsertOne { annotation, .. } = op {
            annotation.validate()?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Versioned annotation records of both kinds.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find<K: AnnotationTable>(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<StoredAnnotation<K>>, StoreError>;

    async fn count<K: AnnotationTable>(&self, filter: &RecordFilter) -> Result<i64, StoreError>;

    /// Highest revision any record of the dataset was created at, or 0.
    async fn max_rev_created<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
    ) -> Result<Revision, StoreError>;

    /// Run `ops` unordered. `Err` means the batch was rejected before any
    /// write; per-operation failures land in [`BulkWriteResult::failures`].
    async fn bulk_write<K: AnnotationTable>(
        &self,
        ops: Vec<WriteOp<K>>,
    ) -> Result<BulkWriteResult, StoreError>;

    async fn find_one<K: AnnotationTable>(
        &self,
        filter: &RecordFilter,
    ) -> Result<Option<StoredAnnotation<K>>, StoreError> {
        let mut query = RecordQuery::all(filter.clone());
        query.limit = Some(1);
        Ok(self.find::<K>(&query).await?.into_iter().next())
    }
}

/// Exclusive right to advance one dataset's revision.
///
/// Dropping a lease without [`RevisionLease::release`] still frees it, but
/// only `release` reports whether that succeeded.
#[async_trait]
pub trait RevisionLease: Send {
    fn dataset_id(&self) -> DbId;

    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

/// The per-dataset revision ledger.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Highest logged revision, or 0.
    async fn head(&self, dataset_id: DbId) -> Result<Revision, StoreError>;

    /// Wait for the dataset's revision lease.
    async fn acquire_lease(&self, dataset_id: DbId) -> Result<Box<dyn RevisionLease>, StoreError>;

    async fn append_revision(
        &self,
        entry: &CreateRevisionLogEntry,
    ) -> Result<RevisionLogEntry, StoreError>;

    /// Entries newest first.
    async fn list_revisions(
        &self,
        dataset_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RevisionLogEntry>, StoreError>;

    async fn count_revisions(&self, dataset_id: DbId) -> Result<i64, StoreError>;

    /// Remove every entry above `revision`, returning how many went.
    async fn truncate_revisions(
        &self,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<u64, StoreError>;
}

/// Stored mask frames keyed by (dataset, track, frame).
#[async_trait]
pub trait MaskItemStore: Send + Sync {
    async fn find_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError>;

    /// Every item of the dataset, or of one track, ordered by track then
    /// frame.
    async fn list_mask_items(
        &self,
        dataset_id: DbId,
        track_id: Option<AnnotationId>,
    ) -> Result<Vec<MaskFrameItem>, StoreError>;

    /// Ensure an item exists with no image attached. Returns the item and
    /// the blob key it pointed at before.
    async fn get_or_create_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<(MaskFrameItem, Option<String>), StoreError>;

    async fn set_mask_blob(&self, item_id: DbId, blob_key: &str) -> Result<MaskFrameItem, StoreError>;

    async fn delete_mask_frame(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError>;

    async fn delete_mask_track(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
    ) -> Result<Vec<MaskFrameItem>, StoreError>;

    async fn delete_mask_items(&self, dataset_id: DbId) -> Result<Vec<MaskFrameItem>, StoreError>;
}

/// Datasets and cross-dataset queries.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn create_dataset(&self, input: &CreateDataset) -> Result<Dataset, StoreError>;

    async fn find_dataset(&self, id: DbId) -> Result<Option<Dataset>, StoreError>;

    /// Remove the dataset together with its records, revision log and mask
    /// items. Returns `false` if it did not exist.
    async fn delete_dataset(&self, id: DbId) -> Result<bool, StoreError>;

    /// Top-label usage of live tracks per (dataset, label), optionally
    /// restricted to `dataset_ids`.
    async fn track_labels(&self, dataset_ids: Option<&[DbId]>) -> Result<Vec<TrackLabel>, StoreError>;
}

/// Everything the services need from one backend.
pub trait Store: RecordStore + RevisionStore + MaskItemStore + DatasetStore + Clone + 'static {}

impl<T> Store for T where T: RecordStore + RevisionStore + MaskItemStore + DatasetStore + Clone + 'static
{}
