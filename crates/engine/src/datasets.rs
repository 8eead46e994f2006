//! Dataset lifecycle and cross-dataset label queries.

use dive_core::error::CoreError;
use dive_core::labels::{aggregate_labels, ConfidenceFilters, LabelSummary};
use dive_core::types::DbId;
use dive_db::models::dataset::{CreateDataset, Dataset};

use crate::masks::MaskService;
use crate::store::Store;

/// Longest accepted dataset name.
const MAX_NAME_LEN: usize = 255;

#[derive(Clone)]
pub struct DatasetService<S> {
    store: S,
    masks: MaskService<S>,
}

impl<S: Store> DatasetService<S> {
    pub fn new(store: S, masks: MaskService<S>) -> Self {
        Self { store, masks }
    }

    /// Create a dataset. `meta` must be a JSON object; a `confidenceFilters`
    /// entry must map labels to numbers.
    pub async fn create_dataset(
        &self,
        name: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Dataset, CoreError> {
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "dataset name must be 1..={MAX_NAME_LEN} characters"
            )));
        }
        if let Some(meta) = &meta {
            if !meta.is_object() {
                return Err(CoreError::Validation(
                    "dataset meta must be a JSON object".into(),
                ));
            }
            ConfidenceFilters::from_meta(meta)?;
        }

        let dataset = self
            .store
            .create_dataset(&CreateDataset {
                name: name.to_string(),
                meta,
            })
            .await?;
        tracing::info!(dataset_id = dataset.id, name = %dataset.name, "Dataset created");
        Ok(dataset)
    }

    pub async fn find_dataset(&self, id: DbId) -> Result<Dataset, CoreError> {
        self.store
            .find_dataset(id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "Dataset",
                id,
            })
    }

    /// Remove a dataset with all of its records, history and masks.
    pub async fn destroy_dataset(&self, id: DbId) -> Result<(), CoreError> {
        self.find_dataset(id).await?;
        let masks_removed = self.masks.purge_dataset(id).await?;
        if !self.store.delete_dataset(id).await? {
            return Err(CoreError::NotFound {
                entity: "Dataset",
                id,
            });
        }
        tracing::info!(dataset_id = id, masks_removed, "Dataset destroyed");
        Ok(())
    }

    /// Label usage across datasets (all of them when `dataset_ids` is
    /// `None`), counting each live track under its first confidence pair.
    pub async fn label_summary(
        &self,
        dataset_ids: Option<&[DbId]>,
    ) -> Result<Vec<LabelSummary>, CoreError> {
        let rows = self.store.track_labels(dataset_ids).await?;
        Ok(aggregate_labels(rows))
    }
}
