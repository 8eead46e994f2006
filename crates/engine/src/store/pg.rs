//! PostgreSQL backend over the `dive-db` repositories.

use async_trait::async_trait;
use dive_core::labels::TrackLabel;
use dive_core::revision::{RecordFilter, RecordQuery, StoredAnnotation};
use dive_core::types::{AnnotationId, DbId, Frame, Revision};
use dive_db::models::annotation::AnnotationTable;
use dive_db::models::dataset::{CreateDataset, Dataset};
use dive_db::models::mask_item::MaskFrameItem;
use dive_db::models::revision::{CreateRevisionLogEntry, RevisionLogEntry};
use dive_db::repositories::{AnnotationRepo, DatasetRepo, MaskItemRepo, RevisionRepo};
use dive_db::DbPool;
use futures::StreamExt;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

use super::{
    validate_inserts, BulkWriteResult, DatasetStore, MaskItemStore, OpOutcome, RecordStore,
    RevisionLease, RevisionStore, WriteOp,
};
use crate::error::StoreError;

/// Operations of one bulk write in flight at once. Kept well below the pool
/// size so the lease connection and readers are never starved.
const DEFAULT_WRITE_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    write_concurrency: usize,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }

    pub fn with_write_concurrency(mut self, n: usize) -> Self {
        self.write_concurrency = n.max(1);
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn apply<K: AnnotationTable>(&self, op: WriteOp<K>) -> Result<OpOutcome, StoreError> {
        match op {
            WriteOp::InsertOne {
                dataset_id,
                revision,
                annotation,
            } => {
                AnnotationRepo::<K>::insert(&self.pool, dataset_id, revision, &annotation).await?;
                Ok(OpOutcome::Inserted)
            }
            WriteOp::SoftDeleteMany { filter, revision } => {
                let n = AnnotationRepo::<K>::soft_delete(&self.pool, &filter, revision).await?;
                Ok(OpOutcome::Modified(n))
            }
            WriteOp::RestoreMany { filter } => {
                let n = AnnotationRepo::<K>::restore(&self.pool, &filter).await?;
                Ok(OpOutcome::Modified(n))
            }
            WriteOp::DeleteMany { filter } => {
                let n = AnnotationRepo::<K>::purge(&self.pool, &filter).await?;
                Ok(OpOutcome::Deleted(n))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[async_trait]
impl RecordStore for PgStore {
    async fn find<K: AnnotationTable>(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<StoredAnnotation<K>>, StoreError> {
        let rows = AnnotationRepo::<K>::find(&self.pool, query).await?;
        rows.into_iter()
            .map(|row| row.into_stored::<K>().map_err(StoreError::from))
            .collect()
    }

    async fn count<K: AnnotationTable>(&self, filter: &RecordFilter) -> Result<i64, StoreError> {
        Ok(AnnotationRepo::<K>::count(&self.pool, filter).await?)
    }

    async fn max_rev_created<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
    ) -> Result<Revision, StoreError> {
        Ok(AnnotationRepo::<K>::max_rev_created(&self.pool, dataset_id).await?)
    }

    async fn bulk_write<K: AnnotationTable>(
        &self,
        ops: Vec<WriteOp<K>>,
    ) -> Result<BulkWriteResult, StoreError> {
        validate_inserts(&ops)?;

        let outcomes: Vec<(usize, Result<OpOutcome, StoreError>)> =
            futures::stream::iter(ops.into_iter().enumerate())
                .map(|(index, op)| async move {
                    let kind = op.kind();
                    let outcome = self.apply(op).await;
                    if let Err(e) = &outcome {
                        tracing::warn!(table = K::TABLE, index, kind, error = %e, "Bulk write operation failed");
                    }
                    (index, outcome)
                })
                .buffer_unordered(self.write_concurrency)
                .collect()
                .await;

        Ok(BulkWriteResult::from_outcomes(outcomes))
    }
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// Session advisory lock held on a connection taken out of the pool.
struct PgRevisionLease {
    dataset_id: DbId,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl RevisionLease for PgRevisionLease {
    fn dataset_id(&self) -> DbId {
        self.dataset_id
    }

    async fn release(mut self: Box<Self>) -> Result<(), StoreError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        match RevisionRepo::unlock_dataset(&mut conn, self.dataset_id).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(dataset_id = self.dataset_id, "Revision lease was not held at release");
                Ok(())
            }
            Err(e) => {
                // The lock dies with the session; never hand it back to the pool.
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for PgRevisionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(
                dataset_id = self.dataset_id,
                "Revision lease dropped without release; closing its connection",
            );
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl RevisionStore for PgStore {
    async fn head(&self, dataset_id: DbId) -> Result<Revision, StoreError> {
        Ok(RevisionRepo::head(&self.pool, dataset_id).await?)
    }

    async fn acquire_lease(&self, dataset_id: DbId) -> Result<Box<dyn RevisionLease>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        if let Err(e) = RevisionRepo::lock_dataset(&mut conn, dataset_id).await {
            drop(conn.detach());
            return Err(e.into());
        }
        Ok(Box::new(PgRevisionLease {
            dataset_id,
            conn: Some(conn),
        }))
    }

    async fn append_revision(
        &self,
        entry: &CreateRevisionLogEntry,
    ) -> Result<RevisionLogEntry, StoreError> {
        Ok(RevisionRepo::create(&self.pool, entry).await?)
    }

    async fn list_revisions(
        &self,
        dataset_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RevisionLogEntry>, StoreError> {
        Ok(RevisionRepo::list(&self.pool, dataset_id, limit, offset).await?)
    }

    async fn count_revisions(&self, dataset_id: DbId) -> Result<i64, StoreError> {
        Ok(RevisionRepo::count(&self.pool, dataset_id).await?)
    }

    async fn truncate_revisions(
        &self,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<u64, StoreError> {
        Ok(RevisionRepo::delete_after(&self.pool, dataset_id, revision).await?)
    }
}

// ---------------------------------------------------------------------------
// Mask items
// ---------------------------------------------------------------------------

#[async_trait]
impl MaskItemStore for PgStore {
    async fn find_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError> {
        Ok(MaskItemRepo::find(&self.pool, dataset_id, track_id, frame_id).await?)
    }

    async fn list_mask_items(
        &self,
        dataset_id: DbId,
        track_id: Option<AnnotationId>,
    ) -> Result<Vec<MaskFrameItem>, StoreError> {
        let items = match track_id {
            Some(track_id) => MaskItemRepo::list_by_track(&self.pool, dataset_id, track_id).await?,
            None => MaskItemRepo::list_by_dataset(&self.pool, dataset_id).await?,
        };
        Ok(items)
    }

    async fn get_or_create_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<(MaskFrameItem, Option<String>), StoreError> {
        Ok(MaskItemRepo::get_or_create(&self.pool, dataset_id, track_id, frame_id).await?)
    }

    async fn set_mask_blob(&self, item_id: DbId, blob_key: &str) -> Result<MaskFrameItem, StoreError> {
        MaskItemRepo::set_blob(&self.pool, item_id, blob_key)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "MaskFrameItem",
                id: item_id,
            })
    }

    async fn delete_mask_frame(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError> {
        Ok(MaskItemRepo::delete_frame(&self.pool, dataset_id, track_id, frame_id).await?)
    }

    async fn delete_mask_track(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
    ) -> Result<Vec<MaskFrameItem>, StoreError> {
        Ok(MaskItemRepo::delete_track(&self.pool, dataset_id, track_id).await?)
    }

    async fn delete_mask_items(&self, dataset_id: DbId) -> Result<Vec<MaskFrameItem>, StoreError> {
        Ok(MaskItemRepo::delete_by_dataset(&self.pool, dataset_id).await?)
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

#[async_trait]
impl DatasetStore for PgStore {
    async fn create_dataset(&self, input: &CreateDataset) -> Result<Dataset, StoreError> {
        Ok(DatasetRepo::create(&self.pool, input).await?)
    }

    async fn find_dataset(&self, id: DbId) -> Result<Option<Dataset>, StoreError> {
        Ok(DatasetRepo::find_by_id(&self.pool, id).await?)
    }

    async fn delete_dataset(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(DatasetRepo::delete(&self.pool, id).await?)
    }

    async fn track_labels(&self, dataset_ids: Option<&[DbId]>) -> Result<Vec<TrackLabel>, StoreError> {
        let rows = DatasetRepo::track_labels(&self.pool, dataset_ids).await?;
        Ok(rows.into_iter().map(TrackLabel::from).collect())
    }
}
