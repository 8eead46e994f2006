//! Repository for the `revision_log` table and the per-dataset revision
//! lease.

use dive_core::types::{DbId, Revision};
use sqlx::{PgConnection, PgPool};

use crate::models::revision::{CreateRevisionLogEntry, RevisionLogEntry};

/// Column list for revision_log queries.
const COLUMNS: &str =
    "id, dataset_id, revision, author, additions, deletions, description, created_at";

/// Advisory lock namespace; hashed together with the dataset id.
const LEASE_NAMESPACE: &str = "dive.revision";

/// Provides append/list/truncate operations on the revision ledger.
pub struct RevisionRepo;

impl RevisionRepo {
    /// Highest logged revision for a dataset, or 0 when nothing is logged.
    pub async fn head(pool: &PgPool, dataset_id: DbId) -> Result<Revision, sqlx::Error> {
        let row: (Revision,) = sqlx::query_as(
            "SELECT COALESCE(MAX(revision), 0)::BIGINT FROM revision_log WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    /// Append one entry, returning the created row.
    pub async fn create(
        pool: &PgPool,
        input: &CreateRevisionLogEntry,
    ) -> Result<RevisionLogEntry, sqlx::Error> {
        let query = format!(
            "INSERT INTO revision_log
                (dataset_id, revision, author, additions, deletions, description)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RevisionLogEntry>(&query)
            .bind(input.dataset_id)
            .bind(input.revision)
            .bind(&input.author)
            .bind(input.additions)
            .bind(input.deletions)
            .bind(&input.description)
            .fetch_one(pool)
            .await
    }

    /// List entries newest first.
    pub async fn list(
        pool: &PgPool,
        dataset_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RevisionLogEntry>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM revision_log
             WHERE dataset_id = $1
             ORDER BY revision DESC
             LIMIT $2 OFFSET $3"
        );
        sqlx::query_as::<_, RevisionLogEntry>(&query)
            .bind(dataset_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Total number of entries for a dataset.
    pub async fn count(pool: &PgPool, dataset_id: DbId) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM revision_log WHERE dataset_id = $1")
            .bind(dataset_id)
            .fetch_one(pool)
            .await?;
        Ok(row.0)
    }

    /// Delete every entry above `revision`. Returns the number removed.
    pub async fn delete_after(
        pool: &PgPool,
        dataset_id: DbId,
        revision: Revision,
    ) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM revision_log WHERE dataset_id = $1 AND revision > $2")
                .bind(dataset_id)
                .bind(revision)
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }

    // ── Revision lease ───────────────────────────────────────────────

    /// Block until this session holds the dataset's revision lock.
    ///
    /// Session-level: the lock lives as long as `conn` does unless released
    /// with [`RevisionRepo::unlock_dataset`].
    pub async fn lock_dataset(conn: &mut PgConnection, dataset_id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_lock(hashtextextended($1, $2))")
            .bind(LEASE_NAMESPACE)
            .bind(dataset_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Release the dataset's revision lock. Returns `false` if this session
    /// did not hold it.
    pub async fn unlock_dataset(
        conn: &mut PgConnection,
        dataset_id: DbId,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtextextended($1, $2))")
            .bind(LEASE_NAMESPACE)
            .bind(dataset_id)
            .fetch_one(&mut *conn)
            .await
    }
}
