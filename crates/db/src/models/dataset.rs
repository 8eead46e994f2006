//! Dataset model and DTOs.

use dive_core::labels::DatasetRef;
use dive_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `datasets` table.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Dataset {
    pub id: DbId,
    pub name: String,
    pub meta: serde_json::Value,
    pub created_at: Timestamp,
}

impl Dataset {
    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// DTO for creating a dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDataset {
    pub name: String,
    pub meta: Option<serde_json::Value>,
}
