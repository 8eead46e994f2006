//! Revisioned save, revision-scoped reads, rollback and history.
//!
//! Every record carries the revision that created it and, once replaced or
//! removed, the revision that deleted it. A revision exists once it is
//! logged; the head of a dataset is its highest logged revision.

use dive_core::annotation::{AnnotationKind, Group, Track};
use dive_core::batch::{AnnotationBatch, KindBatch, SaveOptions};
use dive_core::dive_json::{parse_dive_json, DiveJson};
use dive_core::error::CoreError;
use dive_core::labels::ConfidenceFilters;
use dive_core::mask::MaskPair;
use dive_core::revision::{RecordFilter, RecordQuery, RecordSort};
use dive_core::types::{DbId, Revision};
use dive_db::models::annotation::AnnotationTable;
use dive_db::models::dataset::Dataset;
use dive_db::models::revision::{CreateRevisionLogEntry, RevisionHistory};
use serde::Serialize;

use crate::masks::MaskService;
use crate::store::{Store, WriteFailure, WriteOp};

/// Result of a save: `updated` records inserted, `deleted` records retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub updated: u64,
    pub deleted: u64,
    /// The revision logged for this save, if one was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub revision: Revision,
    pub revisions_removed: u64,
    pub records_purged: u64,
    pub records_restored: u64,
}

/// Revision-scoped listing parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Defaults to the current head.
    pub revision: Option<Revision>,
    /// `None` returns every live record.
    pub limit: Option<i64>,
    pub offset: i64,
    pub sort: RecordSort,
}

impl ListParams {
    pub fn at(revision: Revision) -> Self {
        Self {
            revision: Some(revision),
            ..Self::default()
        }
    }
}

/// Counts from one kind's pair of bulk writes.
struct KindWrite {
    inserted: u64,
    modified: u64,
    failures: Vec<WriteFailure>,
}

#[derive(Clone)]
pub struct VersioningEngine<S> {
    store: S,
    masks: MaskService<S>,
    default_page_limit: i64,
}

impl<S: Store> VersioningEngine<S> {
    pub fn new(store: S, masks: MaskService<S>, default_page_limit: i64) -> Self {
        Self {
            store,
            masks,
            default_page_limit,
        }
    }

    /// Highest logged revision of the dataset, or 0.
    pub async fn head(&self, dataset_id: DbId) -> Result<Revision, CoreError> {
        self.require_dataset(dataset_id).await?;
        Ok(self.store.head(dataset_id).await?)
    }

    // ── Save ─────────────────────────────────────────────────────────

    /// Apply a batch of upserts and deletes as one new revision.
    ///
    /// The revision is logged only when something changed and
    /// `prevent_revision` is unset. Deleting a track also deletes its masks.
    pub async fn save(
        &self,
        dataset_id: DbId,
        batch: &AnnotationBatch,
        options: &SaveOptions,
    ) -> Result<SaveOutcome, CoreError> {
        options.check()?;
        batch.validate()?;
        self.require_dataset(dataset_id).await?;

        let lease = self.store.acquire_lease(dataset_id).await?;
        let result = self.save_under_lease(dataset_id, batch, options).await;
        if let Err(e) = lease.release().await {
            tracing::warn!(dataset_id, error = %e, "Failed to release revision lease");
        }
        let outcome = result?;

        if !options.overwrite {
            let pairs: Vec<MaskPair> = batch
                .tracks
                .effective_deletes()
                .into_iter()
                .map(MaskPair::whole_track)
                .collect();
            if !pairs.is_empty() {
                self.masks.delete_masks(dataset_id, &pairs).await?;
            }
        }
        Ok(outcome)
    }

    async fn save_under_lease(
        &self,
        dataset_id: DbId,
        batch: &AnnotationBatch,
        options: &SaveOptions,
    ) -> Result<SaveOutcome, CoreError> {
        let revision = self.next_revision(dataset_id).await?;

        let tracks = self
            .write_kind(dataset_id, revision, &batch.tracks, options.overwrite)
            .await?;
        let groups = self
            .write_kind(dataset_id, revision, &batch.groups, options.overwrite)
            .await?;

        let additions = tracks.inserted + groups.inserted;
        let deletions = tracks.modified + groups.modified;
        let mut failures = tracks.failures;
        failures.extend(groups.failures);

        let changed = additions > 0 || deletions > 0;
        let logged = if changed && !options.prevent_revision {
            self.store
                .append_revision(&CreateRevisionLogEntry {
                    dataset_id,
                    revision,
                    author: options.author.clone(),
                    additions: additions as i64,
                    deletions: deletions as i64,
                    description: options.description.clone(),
                })
                .await?;
            Some(revision)
        } else {
            None
        };

        if let Some(first) = failures.into_iter().next() {
            tracing::warn!(
                dataset_id,
                revision,
                additions,
                deletions,
                error = %first.error,
                "Save partially applied",
            );
            return Err(first.error.into());
        }

        if changed {
            tracing::info!(
                dataset_id,
                revision = ?logged,
                additions,
                deletions,
                overwrite = options.overwrite,
                "Annotations saved",
            );
        } else {
            tracing::debug!(dataset_id, "No-op save; revision not advanced");
        }

        Ok(SaveOutcome {
            updated: additions,
            deleted: deletions,
            revision: logged,
        })
    }

    /// Retire then insert one kind's records at `revision`.
    async fn write_kind<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
        revision: Revision,
        batch: &KindBatch<K>,
        overwrite: bool,
    ) -> Result<KindWrite, CoreError> {
        let deletes: Vec<WriteOp<K>> = if overwrite {
            vec![WriteOp::SoftDeleteMany {
                filter: RecordFilter::undeleted(dataset_id),
                revision,
            }]
        } else {
            batch
                .effective_deletes()
                .into_iter()
                .chain(batch.upsert.iter().map(|a| a.id()))
                .map(|id| WriteOp::SoftDeleteMany {
                    filter: RecordFilter::undeleted_id(dataset_id, id),
                    revision,
                })
                .collect()
        };
        let inserts: Vec<WriteOp<K>> = batch
            .upsert
            .iter()
            .cloned()
            .map(|annotation| WriteOp::InsertOne {
                dataset_id,
                revision,
                annotation,
            })
            .collect();

        let mut write = KindWrite {
            inserted: 0,
            modified: 0,
            failures: Vec::new(),
        };
        if !deletes.is_empty() {
            let result = self.store.bulk_write(deletes).await?;
            write.modified += result.modified;
            write.failures.extend(result.failures);
        }
        if !inserts.is_empty() {
            let result = self.store.bulk_write(inserts).await?;
            write.inserted += result.inserted;
            write.failures.extend(result.failures);
        }
        Ok(write)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Records live at the requested revision (default: head).
    pub async fn list<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
        params: &ListParams,
    ) -> Result<Vec<K>, CoreError> {
        self.require_dataset(dataset_id).await?;
        let revision = self.resolve_revision(dataset_id, params.revision).await?;
        let query = RecordQuery {
            filter: RecordFilter::live_at(dataset_id, revision),
            sort: params.sort,
            limit: params.limit,
            offset: params.offset.max(0),
        };
        let stored = self.store.find::<K>(&query).await?;
        Ok(stored.into_iter().map(|s| s.annotation).collect())
    }

    /// Number of records live at the requested revision (default: head).
    pub async fn count_live<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
        revision: Option<Revision>,
    ) -> Result<i64, CoreError> {
        self.require_dataset(dataset_id).await?;
        let revision = self.resolve_revision(dataset_id, revision).await?;
        Ok(self
            .store
            .count::<K>(&RecordFilter::live_at(dataset_id, revision))
            .await?)
    }

    /// Snapshot as a DIVE JSON document. With `exclude_below_threshold`,
    /// tracks failing the dataset's confidence filters are left out.
    pub async fn export(
        &self,
        dataset_id: DbId,
        revision: Option<Revision>,
        exclude_below_threshold: bool,
    ) -> Result<DiveJson, CoreError> {
        let dataset = self.require_dataset(dataset_id).await?;
        let params = ListParams {
            revision: Some(self.resolve_revision(dataset_id, revision).await?),
            ..ListParams::default()
        };
        let mut tracks: Vec<Track> = self.list(dataset_id, &params).await?;
        let groups: Vec<Group> = self.list(dataset_id, &params).await?;

        if exclude_below_threshold {
            let filters = ConfidenceFilters::from_meta(&dataset.meta)?;
            let before = tracks.len();
            tracks.retain(|t| filters.passes(t.confidence_pairs()));
            tracing::debug!(
                dataset_id,
                excluded = before - tracks.len(),
                "Applied confidence filters to export",
            );
        }
        Ok(DiveJson::new(tracks, groups))
    }

    /// Save every track and group of a DIVE JSON document (either version).
    pub async fn import_dive_json(
        &self,
        dataset_id: DbId,
        document: serde_json::Value,
        options: &SaveOptions,
    ) -> Result<SaveOutcome, CoreError> {
        let (tracks, groups) = parse_dive_json(document)?.into_annotations();
        let batch = AnnotationBatch {
            tracks: KindBatch::upsert(tracks),
            groups: KindBatch::upsert(groups),
        };
        self.save(dataset_id, &batch, options).await
    }

    /// Revision log entries newest first, plus the total.
    pub async fn history(
        &self,
        dataset_id: DbId,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<RevisionHistory, CoreError> {
        self.require_dataset(dataset_id).await?;
        let limit = limit.unwrap_or(self.default_page_limit);
        if limit <= 0 {
            return Err(CoreError::Validation(format!(
                "history limit must be positive, got {limit}"
            )));
        }
        let entries = self
            .store
            .list_revisions(dataset_id, limit, offset.max(0))
            .await?;
        let total = self.store.count_revisions(dataset_id).await?;
        Ok(RevisionHistory { entries, total })
    }

    // ── Rollback ─────────────────────────────────────────────────────

    /// Discard every revision above `revision`.
    ///
    /// Records created later are removed outright and records deleted later
    /// are live again. Discarded revisions cannot be recovered. Running it
    /// twice with the same target changes nothing the second time.
    pub async fn rollback(
        &self,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<RollbackOutcome, CoreError> {
        if revision < 0 {
            return Err(CoreError::Validation(format!(
                "rollback target must be non-negative, got {revision}"
            )));
        }
        self.require_dataset(dataset_id).await?;

        let lease = self.store.acquire_lease(dataset_id).await?;
        let result = self.rollback_under_lease(dataset_id, revision).await;
        if let Err(e) = lease.release().await {
            tracing::warn!(dataset_id, error = %e, "Failed to release revision lease");
        }
        result
    }

    async fn rollback_under_lease(
        &self,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<RollbackOutcome, CoreError> {
        // The log must never be truncated ahead of its records.
        let (tracks_purged, tracks_restored) = self.rewind_kind::<Track>(dataset_id, revision).await?;
        let (groups_purged, groups_restored) = self.rewind_kind::<Group>(dataset_id, revision).await?;
        let revisions_removed = self.store.truncate_revisions(dataset_id, revision).await?;

        let outcome = RollbackOutcome {
            revision,
            revisions_removed,
            records_purged: tracks_purged + groups_purged,
            records_restored: tracks_restored + groups_restored,
        };
        tracing::info!(
            dataset_id,
            revision,
            revisions_removed,
            purged = outcome.records_purged,
            restored = outcome.records_restored,
            "Rolled back",
        );
        Ok(outcome)
    }

    async fn rewind_kind<K: AnnotationTable>(
        &self,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<(u64, u64), CoreError> {
        let purged = self
            .store
            .bulk_write::<K>(vec![WriteOp::DeleteMany {
                filter: RecordFilter::created_after(dataset_id, revision),
            }])
            .await?;
        if let Some(failure) = purged.failures.into_iter().next() {
            return Err(failure.error.into());
        }

        let restored = self
            .store
            .bulk_write::<K>(vec![WriteOp::RestoreMany {
                filter: RecordFilter::deleted_after(dataset_id, revision),
            }])
            .await?;
        if let Some(failure) = restored.failures.into_iter().next() {
            return Err(failure.error.into());
        }
        Ok((purged.deleted, restored.modified))
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// The revision the next save writes at. Must be called under the lease.
    ///
    /// Saves with `prevent_revision` write records above the logged head, so
    /// the next number clears both the head and every stored `rev_created`.
    async fn next_revision(&self, dataset_id: DbId) -> Result<Revision, CoreError> {
        let head = self.store.head(dataset_id).await?;
        let tracks = self.store.max_rev_created::<Track>(dataset_id).await?;
        let groups = self.store.max_rev_created::<Group>(dataset_id).await?;
        Ok(head.max(tracks).max(groups) + 1)
    }

    async fn resolve_revision(
        &self,
        dataset_id: DbId,
        revision: Option<Revision>,
    ) -> Result<Revision, CoreError> {
        match revision {
            Some(r) if r < 0 => Err(CoreError::Validation(format!(
                "revision must be non-negative, got {r}"
            ))),
            Some(r) => Ok(r),
            None => Ok(self.store.head(dataset_id).await?),
        }
    }

    async fn require_dataset(&self, dataset_id: DbId) -> Result<Dataset, CoreError> {
        self.store
            .find_dataset(dataset_id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "Dataset",
                id: dataset_id,
            })
    }
}
