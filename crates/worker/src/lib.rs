//! Batch mask reconciliation.
//!
//! Rebuilds the RLE index of each requested dataset from its stored mask
//! frames, outside any request path. One failing dataset does not stop the
//! others; the outcome of every dataset is folded into a [`ReconcileTally`].

use dive_core::error::CoreError;
use dive_core::types::DbId;
use dive_engine::masks::Reconciliation;
use dive_engine::store::Store;
use dive_engine::Engine;
use serde::Serialize;

/// A dataset that could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub dataset_id: DbId,
    pub error: String,
}

/// Running totals over a batch of reconciliations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileTally {
    pub datasets_reconciled: usize,
    pub frames_encoded: usize,
    pub frames_skipped: usize,
    pub index_entries: usize,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileTally {
    pub fn record(&mut self, reconciliation: &Reconciliation) {
        self.datasets_reconciled += 1;
        self.frames_encoded += reconciliation.encoded;
        self.frames_skipped += reconciliation.skipped.len();
        self.index_entries += reconciliation.index.len();
    }

    pub fn record_failure(&mut self, dataset_id: DbId, error: &CoreError) {
        self.failures.push(ReconcileFailure {
            dataset_id,
            error: error.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Parse dataset ids from command-line arguments. At least one is required
/// and duplicates are dropped, keeping the first occurrence.
pub fn parse_dataset_ids<I>(args: I) -> Result<Vec<DbId>, CoreError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut ids: Vec<DbId> = Vec::new();
    for arg in args {
        let arg = arg.as_ref();
        let id: DbId = arg
            .parse()
            .map_err(|_| CoreError::Validation(format!("'{arg}' is not a dataset id")))?;
        if id <= 0 {
            return Err(CoreError::Validation(format!("'{arg}' is not a dataset id")));
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(CoreError::Validation(
            "usage: dive-worker <dataset-id>...".into(),
        ));
    }
    Ok(ids)
}

/// Fully rebuild the RLE index of every dataset in `dataset_ids`, in order.
pub async fn reconcile_datasets<S: Store>(
    engine: &Engine<S>,
    dataset_ids: &[DbId],
) -> ReconcileTally {
    let mut tally = ReconcileTally::default();
    for &dataset_id in dataset_ids {
        match reconcile_one(engine, dataset_id).await {
            Ok(reconciliation) => tally.record(&reconciliation),
            Err(e) => {
                tracing::error!(dataset_id, error = %e, "Reconciliation failed");
                tally.record_failure(dataset_id, &e);
            }
        }
    }
    tally
}

async fn reconcile_one<S: Store>(
    engine: &Engine<S>,
    dataset_id: DbId,
) -> Result<Reconciliation, CoreError> {
    engine.datasets.find_dataset(dataset_id).await?;
    engine.masks.update_rle_masks(dataset_id, None).await
}
