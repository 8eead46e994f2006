//! Repository for the `datasets` table and cross-dataset label queries.

use dive_core::types::DbId;
use sqlx::PgPool;

use crate::models::dataset::{CreateDataset, Dataset};
use crate::models::label::TrackLabelRow;

/// Column list for datasets queries.
const COLUMNS: &str = "id, name, meta, created_at";

/// Provides CRUD operations for datasets.
pub struct DatasetRepo;

impl DatasetRepo {
    /// Create a new dataset, returning the created row.
    pub async fn create(pool: &PgPool, input: &CreateDataset) -> Result<Dataset, sqlx::Error> {
        let query = format!(
            "INSERT INTO datasets (name, meta)
             VALUES ($1, COALESCE($2, '{{}}'::jsonb))
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Dataset>(&query)
            .bind(&input.name)
            .bind(&input.meta)
            .fetch_one(pool)
            .await
    }

    /// Find a dataset by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Dataset>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM datasets WHERE id = $1");
        sqlx::query_as::<_, Dataset>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Permanently delete a dataset. Annotation, revision and mask rows go
    /// with it through `ON DELETE CASCADE`. Returns true if a row was deleted.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM datasets WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Tally live tracks by (dataset, top label).
    ///
    /// The top label is the first confidence pair; tracks without pairs are
    /// skipped. `dataset_ids = None` covers every dataset.
    pub async fn track_labels(
        pool: &PgPool,
        dataset_ids: Option<&[DbId]>,
    ) -> Result<Vec<TrackLabelRow>, sqlx::Error> {
        sqlx::query_as::<_, TrackLabelRow>(
            "SELECT
                d.id AS dataset_id,
                d.name AS dataset_name,
                t.body->'confidencePairs'->0->>0 AS label,
                COALESCE(MAX((t.body->'confidencePairs'->0->>1)::float8), 0) AS confidence,
                COUNT(*) AS count
             FROM datasets d
             JOIN annotation_tracks t
               ON t.dataset_id = d.id AND t.rev_deleted IS NULL
             WHERE jsonb_typeof(t.body->'confidencePairs') = 'array'
               AND jsonb_array_length(t.body->'confidencePairs') > 0
               AND ($1::bigint[] IS NULL OR d.id = ANY($1))
             GROUP BY d.id, d.name, t.body->'confidencePairs'->0->>0
             ORDER BY label ASC, d.id ASC",
        )
        .bind(dataset_ids.map(<[DbId]>::to_vec))
        .fetch_all(pool)
        .await
    }
}
