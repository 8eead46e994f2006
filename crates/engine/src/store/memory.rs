//! Process-local backend.
//!
//! Mirrors the PostgreSQL schema closely enough that the services behave the
//! same on both: annotation bodies are stored as JSON, the
//! `(dataset, annotation_id, rev_created)` key is unique, and deleting a
//! dataset cascades.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dive_core::annotation::Track;
use dive_core::labels::{top_label, TrackLabel};
use dive_core::revision::{Liveness, RecordFilter, RecordQuery, RecordSort, StoredAnnotation};
use dive_core::types::{AnnotationId, DbId, Frame, Revision};
use dive_db::models::annotation::AnnotationTable;
use dive_db::models::dataset::{CreateDataset, Dataset};
use dive_db::models::mask_item::MaskFrameItem;
use dive_db::models::revision::{CreateRevisionLogEntry, RevisionLogEntry};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{
    validate_inserts, BulkWriteResult, DatasetStore, MaskItemStore, OpOutcome, RecordStore,
    RevisionLease, RevisionStore, WriteOp,
};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct MemRecord {
    dataset_id: DbId,
    annotation_id: AnnotationId,
    begin: Frame,
    liveness: Liveness,
    body: serde_json::Value,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: DbId,
    datasets: BTreeMap<DbId, Dataset>,
    /// Keyed by table name.
    records: HashMap<&'static str, Vec<MemRecord>>,
    revisions: Vec<RevisionLogEntry>,
    masks: Vec<MaskFrameItem>,
}

impl MemoryState {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn apply<K: AnnotationTable>(&mut self, op: WriteOp<K>) -> Result<OpOutcome, StoreError> {
        match op {
            WriteOp::InsertOne {
                dataset_id,
                revision,
                annotation,
            } => {
                if !self.datasets.contains_key(&dataset_id) {
                    return Err(StoreError::NotFound {
                        entity: "Dataset",
                        id: dataset_id,
                    });
                }
                let body = serde_json::to_value(&annotation)?;
                let records = self.records.entry(K::TABLE).or_default();
                let annotation_id = annotation.id();
                if records.iter().any(|r| {
                    r.dataset_id == dataset_id
                        && r.annotation_id == annotation_id
                        && r.liveness.rev_created() == revision
                }) {
                    return Err(StoreError::Conflict(format!(
                        "{} {annotation_id} already created at revision {revision}",
                        K::ENTITY
                    )));
                }
                records.push(MemRecord {
                    dataset_id,
                    annotation_id,
                    begin: annotation.begin(),
                    liveness: Liveness::Live {
                        rev_created: revision,
                    },
                    body,
                });
                Ok(OpOutcome::Inserted)
            }
            WriteOp::SoftDeleteMany { filter, revision } => {
                let mut n = 0;
                for r in self.matching_mut(K::TABLE, &filter) {
                    if r.liveness.rev_deleted().is_none() {
                        r.liveness = r.liveness.delete_at(revision);
                        n += 1;
                    }
                }
                Ok(OpOutcome::Modified(n))
            }
            WriteOp::RestoreMany { filter } => {
                let mut n = 0;
                for r in self.matching_mut(K::TABLE, &filter) {
                    if r.liveness.rev_deleted().is_some() {
                        r.liveness = r.liveness.restore();
                        n += 1;
                    }
                }
                Ok(OpOutcome::Modified(n))
            }
            WriteOp::DeleteMany { filter } => {
                let records = self.records.entry(K::TABLE).or_default();
                let before = records.len();
                records.retain(|r| !filter.matches(r.dataset_id, r.annotation_id, r.liveness));
                Ok(OpOutcome::Deleted((before - records.len()) as u64))
            }
        }
    }

    fn matching_mut<'a>(
        &'a mut self,
        table: &'static str,
        filter: &'a RecordFilter,
    ) -> impl Iterator<Item = &'a mut MemRecord> + 'a {
        self.records
            .entry(table)
            .or_default()
            .iter_mut()
            .filter(move |r| filter.matches(r.dataset_id, r.annotation_id, r.liveness))
    }

    fn matching(&self, table: &'static str, filter: &RecordFilter) -> Vec<&MemRecord> {
        self.records
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.matches(r.dataset_id, r.annotation_id, r.liveness))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory implementation of every storage trait.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    leases: Arc<Mutex<HashMap<DbId, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find<K: AnnotationTable>(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<StoredAnnotation<K>>, StoreError> {
        let state = self.state.read().await;
        let mut hits = state.matching(K::TABLE, &query.filter);
        match query.sort {
            RecordSort::IdAsc => {
                hits.sort_by_key(|r| (r.annotation_id, r.liveness.rev_created()))
            }
            RecordSort::IdDesc => hits.sort_by_key(|r| {
                std::cmp::Reverse((r.annotation_id, r.liveness.rev_created()))
            }),
            RecordSort::BeginAsc => {
                hits.sort_by_key(|r| (r.begin, r.annotation_id, r.liveness.rev_created()))
            }
        }

        let offset = usize::try_from(query.offset.max(0)).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map(|l| usize::try_from(l.max(0)).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);

        hits.into_iter()
            .skip(offset)
            .take(limit)
            .map(|r| {
                Ok(StoredAnnotation {
                    dataset_id: r.dataset_id,
                    liveness: r.liveness,
                    annotation: serde_json::from_value(r.body.clone())?,
                })
            })
            .collect()
    }

    async fn count<K: AnnotationTable>(&self, filter: &RecordFilter) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state.matching(K::TABLE, filter).len() as i64)
    }

    async fn max_rev_created<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
    ) -> Result<Revision, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .matching(K::TABLE, &RecordFilter::dataset(dataset_id))
            .iter()
            .map(|r| r.liveness.rev_created())
            .max()
            .unwrap_or(0))
    }

    async fn bulk_write<K: AnnotationTable>(
        &self,
        ops: Vec<WriteOp<K>>,
    ) -> Result<BulkWriteResult, StoreError> {
        validate_inserts(&ops)?;

        let mut state = self.state.write().await;
        let outcomes: Vec<_> = ops
            .into_iter()
            .enumerate()
            .map(|(index, op)| (index, state.apply(op)))
            .collect();
        Ok(BulkWriteResult::from_outcomes(outcomes))
    }
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

struct MemoryRevisionLease {
    dataset_id: DbId,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl RevisionLease for MemoryRevisionLease {
    fn dataset_id(&self) -> DbId {
        self.dataset_id
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl RevisionStore for MemoryStore {
    async fn head(&self, dataset_id: DbId) -> Result<Revision, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .revisions
            .iter()
            .filter(|e| e.dataset_id == dataset_id)
            .map(|e| e.revision)
            .max()
            .unwrap_or(0))
    }

    async fn acquire_lease(&self, dataset_id: DbId) -> Result<Box<dyn RevisionLease>, StoreError> {
        let lock = self.leases.lock().await.entry(dataset_id).or_default().clone();
        let guard = lock.lock_owned().await;
        Ok(Box::new(MemoryRevisionLease {
            dataset_id,
            _guard: guard,
        }))
    }

    async fn append_revision(
        &self,
        entry: &CreateRevisionLogEntry,
    ) -> Result<RevisionLogEntry, StoreError> {
        let mut state = self.state.write().await;
        if !state.datasets.contains_key(&entry.dataset_id) {
            return Err(StoreError::NotFound {
                entity: "Dataset",
                id: entry.dataset_id,
            });
        }
        if state
            .revisions
            .iter()
            .any(|e| e.dataset_id == entry.dataset_id && e.revision == entry.revision)
        {
            return Err(StoreError::Conflict(format!(
                "revision {} already logged for dataset {}",
                entry.revision, entry.dataset_id
            )));
        }
        let logged = RevisionLogEntry {
            id: state.next_id(),
            dataset_id: entry.dataset_id,
            revision: entry.revision,
            author: entry.author.clone(),
            additions: entry.additions,
            deletions: entry.deletions,
            description: entry.description.clone(),
            created_at: Utc::now(),
        };
        state.revisions.push(logged.clone());
        Ok(logged)
    }

    async fn list_revisions(
        &self,
        dataset_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RevisionLogEntry>, StoreError> {
        let state = self.state.read().await;
        let mut entries: Vec<RevisionLogEntry> = state
            .revisions
            .iter()
            .filter(|e| e.dataset_id == dataset_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(entries
            .into_iter()
            .skip(usize::try_from(offset.max(0)).unwrap_or(usize::MAX))
            .take(usize::try_from(limit.max(0)).unwrap_or(usize::MAX))
            .collect())
    }

    async fn count_revisions(&self, dataset_id: DbId) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .revisions
            .iter()
            .filter(|e| e.dataset_id == dataset_id)
            .count() as i64)
    }

    async fn truncate_revisions(
        &self,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let before = state.revisions.len();
        state
            .revisions
            .retain(|e| !(e.dataset_id == dataset_id && e.revision > revision));
        Ok((before - state.revisions.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Mask items
// ---------------------------------------------------------------------------

fn sort_items(items: &mut [MaskFrameItem]) {
    items.sort_by_key(|i| (i.track_id, i.frame_id));
}

#[async_trait]
impl MaskItemStore for MemoryStore {
    async fn find_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .masks
            .iter()
            .find(|i| i.dataset_id == dataset_id && i.track_id == track_id && i.frame_id == frame_id)
            .cloned())
    }

    async fn list_mask_items(
        &self,
        dataset_id: DbId,
        track_id: Option<AnnotationId>,
    ) -> Result<Vec<MaskFrameItem>, StoreError> {
        let state = self.state.read().await;
        let mut items: Vec<MaskFrameItem> = state
            .masks
            .iter()
            .filter(|i| i.dataset_id == dataset_id && track_id.map_or(true, |t| i.track_id == t))
            .cloned()
            .collect();
        sort_items(&mut items);
        Ok(items)
    }

    async fn get_or_create_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<(MaskFrameItem, Option<String>), StoreError> {
        let mut state = self.state.write().await;
        if !state.datasets.contains_key(&dataset_id) {
            return Err(StoreError::NotFound {
                entity: "Dataset",
                id: dataset_id,
            });
        }
        let now = Utc::now();
        if let Some(item) = state
            .masks
            .iter_mut()
            .find(|i| i.dataset_id == dataset_id && i.track_id == track_id && i.frame_id == frame_id)
        {
            let previous = item.blob_key.take();
            item.updated_at = now;
            return Ok((item.clone(), previous));
        }
        let item = MaskFrameItem {
            id: state.next_id(),
            dataset_id,
            track_id,
            frame_id,
            blob_key: None,
            created_at: now,
            updated_at: now,
        };
        state.masks.push(item.clone());
        Ok((item, None))
    }

    async fn set_mask_blob(&self, item_id: DbId, blob_key: &str) -> Result<MaskFrameItem, StoreError> {
        let mut state = self.state.write().await;
        let item = state
            .masks
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or(StoreError::NotFound {
                entity: "MaskFrameItem",
                id: item_id,
            })?;
        item.blob_key = Some(blob_key.to_string());
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn delete_mask_frame(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, StoreError> {
        let mut state = self.state.write().await;
        let pos = state
            .masks
            .iter()
            .position(|i| i.dataset_id == dataset_id && i.track_id == track_id && i.frame_id == frame_id);
        Ok(pos.map(|p| state.masks.remove(p)))
    }

    async fn delete_mask_track(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
    ) -> Result<Vec<MaskFrameItem>, StoreError> {
        let mut state = self.state.write().await;
        let (mut removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.masks)
            .into_iter()
            .partition(|i| i.dataset_id == dataset_id && i.track_id == track_id);
        state.masks = kept;
        sort_items(&mut removed);
        Ok(removed)
    }

    async fn delete_mask_items(&self, dataset_id: DbId) -> Result<Vec<MaskFrameItem>, StoreError> {
        let mut state = self.state.write().await;
        let (mut removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.masks)
            .into_iter()
            .partition(|i| i.dataset_id == dataset_id);
        state.masks = kept;
        sort_items(&mut removed);
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

#[async_trait]
impl DatasetStore for MemoryStore {
    async fn create_dataset(&self, input: &CreateDataset) -> Result<Dataset, StoreError> {
        let mut state = self.state.write().await;
        let dataset = Dataset {
            id: state.next_id(),
            name: input.name.clone(),
            meta: input
                .meta
                .clone()
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            created_at: Utc::now(),
        };
        state.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    async fn find_dataset(&self, id: DbId) -> Result<Option<Dataset>, StoreError> {
        Ok(self.state.read().await.datasets.get(&id).cloned())
    }

    async fn delete_dataset(&self, id: DbId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.datasets.remove(&id).is_none() {
            return Ok(false);
        }
        for records in state.records.values_mut() {
            records.retain(|r| r.dataset_id != id);
        }
        state.revisions.retain(|e| e.dataset_id != id);
        state.masks.retain(|i| i.dataset_id != id);
        Ok(true)
    }

    async fn track_labels(&self, dataset_ids: Option<&[DbId]>) -> Result<Vec<TrackLabel>, StoreError> {
        let state = self.state.read().await;
        let mut by_key: BTreeMap<(DbId, String), (f64, i64)> = BTreeMap::new();

        for dataset in state.datasets.values() {
            if dataset_ids.is_some_and(|ids| !ids.contains(&dataset.id)) {
                continue;
            }
            for r in state.matching(Track::TABLE, &RecordFilter::undeleted(dataset.id)) {
                let track: Track = serde_json::from_value(r.body.clone())?;
                let Some(pair) = top_label(&track.confidence_pairs) else {
                    continue;
                };
                let slot = by_key
                    .entry((dataset.id, pair.label().to_string()))
                    .or_insert((f64::MIN, 0));
                slot.0 = slot.0.max(pair.confidence());
                slot.1 += 1;
            }
        }

        Ok(by_key
            .into_iter()
            .filter_map(|((dataset_id, label), (confidence, count))| {
                let dataset = state.datasets.get(&dataset_id)?;
                Some(TrackLabel {
                    dataset: dataset.dataset_ref(),
                    label,
                    confidence,
                    count,
                })
            })
            .collect())
    }
}
