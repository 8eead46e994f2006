//! Revision log model and DTOs.

use dive_core::types::{DbId, Revision, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `revision_log` table.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct RevisionLogEntry {
    pub id: DbId,
    pub dataset_id: DbId,
    pub revision: Revision,
    pub author: String,
    pub additions: i64,
    pub deletions: i64,
    pub description: String,
    pub created_at: Timestamp,
}

/// DTO for appending a revision.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRevisionLogEntry {
    pub dataset_id: DbId,
    pub revision: Revision,
    pub author: String,
    pub additions: i64,
    pub deletions: i64,
    pub description: String,
}

/// One page of history plus the total number of entries.
#[derive(Debug, Clone, Serialize)]
pub struct RevisionHistory {
    pub entries: Vec<RevisionLogEntry>,
    pub total: i64,
}
