//! Repository for the `mask_items` table.

use dive_core::types::{AnnotationId, DbId, Frame};
use sqlx::PgPool;

use crate::models::mask_item::MaskFrameItem;

/// Column list for mask_items queries.
const COLUMNS: &str = "id, dataset_id, track_id, frame_id, blob_key, created_at, updated_at";

/// Provides keyed access to stored mask frames.
pub struct MaskItemRepo;

impl MaskItemRepo {
    /// Find the item for one (track, frame).
    pub async fn find(
        pool: &PgPool,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM mask_items
             WHERE dataset_id = $1 AND track_id = $2 AND frame_id = $3"
        );
        sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(dataset_id)
            .bind(track_id)
            .bind(frame_id)
            .fetch_optional(pool)
            .await
    }

    /// List every item of a dataset ordered by track then frame.
    pub async fn list_by_dataset(
        pool: &PgPool,
        dataset_id: DbId,
    ) -> Result<Vec<MaskFrameItem>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM mask_items
             WHERE dataset_id = $1
             ORDER BY track_id ASC, frame_id ASC"
        );
        sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(dataset_id)
            .fetch_all(pool)
            .await
    }

    /// List every item of one track ordered by frame.
    pub async fn list_by_track(
        pool: &PgPool,
        dataset_id: DbId,
        track_id: AnnotationId,
    ) -> Result<Vec<MaskFrameItem>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM mask_items
             WHERE dataset_id = $1 AND track_id = $2
             ORDER BY frame_id ASC"
        );
        sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(dataset_id)
            .bind(track_id)
            .fetch_all(pool)
            .await
    }

    /// Ensure an item exists for (track, frame) with no image attached.
    ///
    /// Returns the item and the blob key it previously pointed at, so the
    /// caller can drop the old bytes. The row is created first and then
    /// locked, so concurrent callers serialize on it and each previous key
    /// is handed to exactly one of them.
    pub async fn get_or_create(
        pool: &PgPool,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<(MaskFrameItem, Option<String>), sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "INSERT INTO mask_items (dataset_id, track_id, frame_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (dataset_id, track_id, frame_id) DO NOTHING",
        )
        .bind(dataset_id)
        .bind(track_id)
        .bind(frame_id)
        .execute(&mut *tx)
        .await?;

        let (id, previous): (DbId, Option<String>) = sqlx::query_as(
            "SELECT id, blob_key FROM mask_items
             WHERE dataset_id = $1 AND track_id = $2 AND frame_id = $3
             FOR UPDATE",
        )
        .bind(dataset_id)
        .bind(track_id)
        .bind(frame_id)
        .fetch_one(&mut *tx)
        .await?;

        let query = format!(
            "UPDATE mask_items SET blob_key = NULL, updated_at = NOW()
             WHERE id = $1
             RETURNING {COLUMNS}"
        );
        let item = sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((item, previous))
    }

    /// Point an item at newly written image bytes.
    pub async fn set_blob(
        pool: &PgPool,
        id: DbId,
        blob_key: &str,
    ) -> Result<Option<MaskFrameItem>, sqlx::Error> {
        let query = format!(
            "UPDATE mask_items SET blob_key = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(id)
            .bind(blob_key)
            .fetch_optional(pool)
            .await
    }

    /// Delete one frame item, returning it if it existed.
    pub async fn delete_frame(
        pool: &PgPool,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<Option<MaskFrameItem>, sqlx::Error> {
        let query = format!(
            "DELETE FROM mask_items
             WHERE dataset_id = $1 AND track_id = $2 AND frame_id = $3
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(dataset_id)
            .bind(track_id)
            .bind(frame_id)
            .fetch_optional(pool)
            .await
    }

    /// Delete every frame item of a track, returning the removed items.
    pub async fn delete_track(
        pool: &PgPool,
        dataset_id: DbId,
        track_id: AnnotationId,
    ) -> Result<Vec<MaskFrameItem>, sqlx::Error> {
        let query = format!(
            "DELETE FROM mask_items
             WHERE dataset_id = $1 AND track_id = $2
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(dataset_id)
            .bind(track_id)
            .fetch_all(pool)
            .await
    }

    /// Delete every item of a dataset, returning the removed items.
    pub async fn delete_by_dataset(
        pool: &PgPool,
        dataset_id: DbId,
    ) -> Result<Vec<MaskFrameItem>, sqlx::Error> {
        let query = format!("DELETE FROM mask_items WHERE dataset_id = $1 RETURNING {COLUMNS}");
        sqlx::query_as::<_, MaskFrameItem>(&query)
            .bind(dataset_id)
            .fetch_all(pool)
            .await
    }
}
