//! Label aggregation rows.

use dive_core::labels::{DatasetRef, TrackLabel};
use dive_core::types::DbId;
use sqlx::FromRow;

/// Per-(dataset, top label) tally of live tracks.
#[derive(Debug, Clone, FromRow)]
pub struct TrackLabelRow {
    pub dataset_id: DbId,
    pub dataset_name: String,
    pub label: String,
    pub confidence: f64,
    pub count: i64,
}

impl From<TrackLabelRow> for TrackLabel {
    fn from(row: TrackLabelRow) -> Self {
        TrackLabel {
            dataset: DatasetRef {
                id: row.dataset_id,
                name: row.dataset_name,
            },
            label: row.label,
            confidence: row.confidence,
            count: row.count,
        }
    }
}
