//! Repository for the versioned `annotation_tracks` / `annotation_groups`
//! tables.
//!
//! Both tables share one layout, so one generic repository serves both
//! kinds; [`AnnotationTable`] picks the table.

use std::marker::PhantomData;

use dive_core::annotation::{Group, Track};
use dive_core::revision::{RecordFilter, RecordQuery, RecordSort};
use dive_core::types::{DbId, Revision};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::models::annotation::{AnnotationRow, AnnotationTable};

/// Column list for annotation queries.
const COLUMNS: &str = "id, dataset_id, annotation_id, rev_created, rev_deleted, body, created_at";

/// Provides revision-scoped reads and bulk revision writes for one kind.
pub struct AnnotationRepo<K>(PhantomData<K>);

pub type TrackRepo = AnnotationRepo<Track>;
pub type GroupRepo = AnnotationRepo<Group>;

/// Append `WHERE ...` for a record filter.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RecordFilter) {
    qb.push(" WHERE dataset_id = ").push_bind(filter.dataset_id);
    if let Some(id) = filter.annotation_id {
        qb.push(" AND annotation_id = ").push_bind(id);
    }
    if let Some(r) = filter.live_at {
        qb.push(" AND rev_created <= ")
            .push_bind(r)
            .push(" AND (rev_deleted IS NULL OR rev_deleted > ")
            .push_bind(r)
            .push(")");
    }
    if filter.undeleted {
        qb.push(" AND rev_deleted IS NULL");
    }
    if let Some(r) = filter.created_after {
        qb.push(" AND rev_created > ").push_bind(r);
    }
    if let Some(r) = filter.deleted_after {
        qb.push(" AND rev_deleted > ").push_bind(r);
    }
}

impl<K: AnnotationTable> AnnotationRepo<K> {
    /// Find records matching a query, sorted and paginated.
    pub async fn find(pool: &PgPool, query: &RecordQuery) -> Result<Vec<AnnotationRow>, sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM {}", K::TABLE));
        push_filter(&mut qb, &query.filter);
        qb.push(match query.sort {
            RecordSort::IdAsc => " ORDER BY annotation_id ASC, rev_created ASC",
            RecordSort::IdDesc => " ORDER BY annotation_id DESC, rev_created DESC",
            RecordSort::BeginAsc => " ORDER BY begin_frame ASC, annotation_id ASC, rev_created ASC",
        });
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        if query.offset > 0 {
            qb.push(" OFFSET ").push_bind(query.offset);
        }
        qb.build_query_as::<AnnotationRow>().fetch_all(pool).await
    }

    /// Count records matching a filter.
    pub async fn count(pool: &PgPool, filter: &RecordFilter) -> Result<i64, sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {}", K::TABLE));
        push_filter(&mut qb, filter);
        qb.build_query_scalar::<i64>().fetch_one(pool).await
    }

    /// Highest `rev_created` of any record in the dataset, deleted or not, or
    /// 0. Unlogged saves can leave this above the logged head.
    pub async fn max_rev_created(pool: &PgPool, dataset_id: DbId) -> Result<Revision, sqlx::Error> {
        let query = format!(
            "SELECT COALESCE(MAX(rev_created), 0)::BIGINT FROM {} WHERE dataset_id = $1",
            K::TABLE
        );
        sqlx::query_scalar::<_, Revision>(&query)
            .bind(dataset_id)
            .fetch_one(pool)
            .await
    }

    /// Insert one record created at `revision`.
    ///
    /// Fails with a unique violation on
    /// `(dataset_id, annotation_id, rev_created)` when another writer already
    /// created the same id at the same revision.
    pub async fn insert(
        pool: &PgPool,
        dataset_id: DbId,
        revision: Revision,
        annotation: &K,
    ) -> Result<AnnotationRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO {}
                (dataset_id, annotation_id, rev_created, begin_frame, end_frame, body)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {COLUMNS}",
            K::TABLE
        );
        sqlx::query_as::<_, AnnotationRow>(&query)
            .bind(dataset_id)
            .bind(annotation.id())
            .bind(revision)
            .bind(annotation.begin())
            .bind(annotation.end())
            .bind(Json(annotation))
            .fetch_one(pool)
            .await
    }

    /// Mark every not-yet-deleted record matching `filter` as deleted at
    /// `revision`. Returns the number of rows modified.
    pub async fn soft_delete(
        pool: &PgPool,
        filter: &RecordFilter,
        revision: Revision,
    ) -> Result<u64, sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET rev_deleted = ", K::TABLE));
        qb.push_bind(revision);
        push_filter(&mut qb, filter);
        qb.push(" AND rev_deleted IS NULL");
        let result = qb.build().execute(pool).await?;
        Ok(result.rows_affected())
    }

    /// Clear the deletion mark on every deleted record matching `filter`.
    pub async fn restore(pool: &PgPool, filter: &RecordFilter) -> Result<u64, sqlx::Error> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("UPDATE {} SET rev_deleted = NULL", K::TABLE));
        push_filter(&mut qb, filter);
        qb.push(" AND rev_deleted IS NOT NULL");
        let result = qb.build().execute(pool).await?;
        Ok(result.rows_affected())
    }

    /// Permanently delete every record matching `filter`.
    pub async fn purge(pool: &PgPool, filter: &RecordFilter) -> Result<u64, sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("DELETE FROM {}", K::TABLE));
        push_filter(&mut qb, filter);
        let result = qb.build().execute(pool).await?;
        Ok(result.rows_affected())
    }
}
