//! Revision liveness predicate and revision-scoped record filters.
//!
//! A stored annotation is live at revision `R` iff it was created at or
//! before `R` and has not been deleted at or before `R`. The predicate is a
//! total function over [`Liveness`], so no caller has to reason about a
//! nullable deletion column.

use serde::Serialize;

use crate::annotation::AnnotationKind;
use crate::types::{AnnotationId, DbId, Revision};

/// The implicit empty revision every dataset starts at.
pub const EMPTY_REVISION: Revision = 0;

/// Creation/deletion state of one stored annotation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liveness {
    /// Not deleted at any revision so far.
    Live { rev_created: Revision },
    /// Soft-deleted at `rev_deleted`.
    Deleted {
        rev_created: Revision,
        rev_deleted: Revision,
    },
}

impl Liveness {
    /// Build from the stored column pair.
    pub fn from_columns(rev_created: Revision, rev_deleted: Option<Revision>) -> Self {
        match rev_deleted {
            None => Self::Live { rev_created },
            Some(rev_deleted) => Self::Deleted {
                rev_created,
                rev_deleted,
            },
        }
    }

    pub fn rev_created(self) -> Revision {
        match self {
            Self::Live { rev_created } | Self::Deleted { rev_created, .. } => rev_created,
        }
    }

    pub fn rev_deleted(self) -> Option<Revision> {
        match self {
            Self::Live { .. } => None,
            Self::Deleted { rev_deleted, .. } => Some(rev_deleted),
        }
    }

    /// `rev_created <= r && (rev_deleted unset || rev_deleted > r)`
    pub fn is_live_at(self, revision: Revision) -> bool {
        match self {
            Self::Live { rev_created } => rev_created <= revision,
            Self::Deleted {
                rev_created,
                rev_deleted,
            } => rev_created <= revision && rev_deleted > revision,
        }
    }

    /// Mark as deleted at `revision`. Already-deleted records keep their
    /// original deletion revision.
    pub fn delete_at(self, revision: Revision) -> Self {
        match self {
            Self::Live { rev_created } => Self::Deleted {
                rev_created,
                rev_deleted: revision,
            },
            deleted @ Self::Deleted { .. } => deleted,
        }
    }

    /// Clear the deletion mark.
    pub fn restore(self) -> Self {
        Self::Live {
            rev_created: self.rev_created(),
        }
    }
}

/// A persisted track or group together with its revision bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAnnotation<K> {
    pub dataset_id: DbId,
    pub liveness: Liveness,
    pub annotation: K,
}

impl<K: AnnotationKind> StoredAnnotation<K> {
    pub fn annotation_id(&self) -> AnnotationId {
        self.annotation.id()
    }

    pub fn is_live_at(&self, revision: Revision) -> bool {
        self.liveness.is_live_at(revision)
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Conjunctive predicate over stored annotation records of one dataset.
///
/// Every backend evaluates the same fields; [`RecordFilter::matches`] is the
/// reference evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub dataset_id: DbId,
    pub annotation_id: Option<AnnotationId>,
    /// Live at this revision.
    pub live_at: Option<Revision>,
    /// `rev_deleted` is unset.
    pub undeleted: bool,
    /// `rev_created > n`
    pub created_after: Option<Revision>,
    /// `rev_deleted > n` (implies deleted)
    pub deleted_after: Option<Revision>,
}

impl RecordFilter {
    /// Every record of a dataset, live or not.
    pub fn dataset(dataset_id: DbId) -> Self {
        Self {
            dataset_id,
            annotation_id: None,
            live_at: None,
            undeleted: false,
            created_after: None,
            deleted_after: None,
        }
    }

    /// Records live at `revision`.
    pub fn live_at(dataset_id: DbId, revision: Revision) -> Self {
        Self {
            live_at: Some(revision),
            ..Self::dataset(dataset_id)
        }
    }

    /// Records not yet soft-deleted (the current live set).
    pub fn undeleted(dataset_id: DbId) -> Self {
        Self {
            undeleted: true,
            ..Self::dataset(dataset_id)
        }
    }

    /// The not-yet-deleted record with the given annotation id.
    pub fn undeleted_id(dataset_id: DbId, annotation_id: AnnotationId) -> Self {
        Self {
            annotation_id: Some(annotation_id),
            ..Self::undeleted(dataset_id)
        }
    }

    /// Records created after `revision` (rollback purge set).
    pub fn created_after(dataset_id: DbId, revision: Revision) -> Self {
        Self {
            created_after: Some(revision),
            ..Self::dataset(dataset_id)
        }
    }

    /// Records deleted after `revision` (rollback restore set).
    pub fn deleted_after(dataset_id: DbId, revision: Revision) -> Self {
        Self {
            deleted_after: Some(revision),
            ..Self::dataset(dataset_id)
        }
    }

    pub fn matches(&self, dataset_id: DbId, annotation_id: AnnotationId, liveness: Liveness) -> bool {
        if dataset_id != self.dataset_id {
            return false;
        }
        if self.annotation_id.is_some_and(|id| id != annotation_id) {
            return false;
        }
        if self.live_at.is_some_and(|r| !liveness.is_live_at(r)) {
            return false;
        }
        if self.undeleted && liveness.rev_deleted().is_some() {
            return false;
        }
        if self.created_after.is_some_and(|r| liveness.rev_created() <= r) {
            return false;
        }
        if let Some(r) = self.deleted_after {
            match liveness.rev_deleted() {
                Some(deleted) if deleted > r => {}
                _ => return false,
            }
        }
        true
    }
}

/// Sort order for record listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordSort {
    #[default]
    IdAsc,
    IdDesc,
    BeginAsc,
}

impl RecordSort {
    /// Parse from a query-string value (`id`, `-id`, `begin`).
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "id" => Some(Self::IdAsc),
            "-id" => Some(Self::IdDesc),
            "begin" => Some(Self::BeginAsc),
            _ => None,
        }
    }
}

/// A paginated, sorted record lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub filter: RecordFilter,
    pub sort: RecordSort,
    /// `None` means unbounded.
    pub limit: Option<i64>,
    pub offset: i64,
}

impl RecordQuery {
    pub fn all(filter: RecordFilter) -> Self {
        Self {
            filter,
            sort: RecordSort::IdAsc,
            limit: None,
            offset: 0,
        }
    }
}
