//! Confidence threshold filters and cross-dataset label aggregation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::annotation::ConfidencePair;
use crate::error::CoreError;
use crate::types::DbId;

/// Dataset metadata key holding the threshold map.
pub const CONFIDENCE_FILTERS_KEY: &str = "confidenceFilters";

/// Threshold key applied to labels without their own entry.
pub const DEFAULT_FILTER_KEY: &str = "default";

// ---------------------------------------------------------------------------
// Confidence filters
// ---------------------------------------------------------------------------

/// Per-label minimum confidence, with an optional `default` fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfidenceFilters(BTreeMap<String, f64>);

impl ConfidenceFilters {
    pub fn new(thresholds: BTreeMap<String, f64>) -> Self {
        Self(thresholds)
    }

    /// Read `confidenceFilters` from dataset metadata. A missing key yields
    /// no filtering.
    pub fn from_meta(meta: &serde_json::Value) -> Result<Self, CoreError> {
        match meta.get(CONFIDENCE_FILTERS_KEY) {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
                CoreError::Validation(format!(
                    "{CONFIDENCE_FILTERS_KEY} must map labels to numbers: {e}"
                ))
            }),
        }
    }

    /// Threshold for `label`: its own entry, else `default`, else 0.
    pub fn threshold(&self, label: &str) -> f64 {
        self.0
            .get(label)
            .or_else(|| self.0.get(DEFAULT_FILTER_KEY))
            .copied()
            .unwrap_or(0.0)
    }

    /// A track passes when any of its pairs meets its label's threshold.
    /// Tracks without pairs always pass.
    pub fn passes(&self, pairs: &[ConfidencePair]) -> bool {
        pairs.is_empty()
            || pairs
                .iter()
                .any(|p| p.confidence() >= self.threshold(p.label()))
    }
}

// ---------------------------------------------------------------------------
// Label aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetRef {
    pub id: DbId,
    pub name: String,
}

/// Top-label usage within one dataset, as fed to [`aggregate_labels`].
///
/// `count` live tracks of `dataset` carry `label` as their top label, the
/// highest confidence among them being `confidence`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackLabel {
    pub dataset: DatasetRef,
    pub label: String,
    pub confidence: f64,
    pub count: i64,
}

/// Aggregated usage of one label across datasets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelSummary {
    /// `[name, highest confidence seen]`
    pub label: ConfidencePair,
    pub count: i64,
    pub datasets: Vec<DatasetRef>,
}

/// The label a track is counted under: its first confidence pair.
pub fn top_label(pairs: &[ConfidencePair]) -> Option<&ConfidencePair> {
    pairs.first()
}

/// Fold per-track labels into per-label summaries, ordered by label name.
pub fn aggregate_labels(rows: impl IntoIterator<Item = TrackLabel>) -> Vec<LabelSummary> {
    struct Acc {
        max_confidence: f64,
        count: i64,
        datasets: BTreeSet<DatasetRef>,
    }

    let mut by_label: BTreeMap<String, Acc> = BTreeMap::new();
    for row in rows {
        let acc = by_label.entry(row.label).or_insert(Acc {
            max_confidence: f64::MIN,
            count: 0,
            datasets: BTreeSet::new(),
        });
        acc.max_confidence = acc.max_confidence.max(row.confidence);
        acc.count += row.count;
        acc.datasets.insert(row.dataset);
    }

    by_label
        .into_iter()
        .map(|(name, acc)| LabelSummary {
            label: ConfidencePair(name, acc.max_confidence),
            count: acc.count,
            datasets: acc.datasets.into_iter().collect(),
        })
        .collect()
}
