//! Feature and track merging for mask/track package imports.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::annotation::{Feature, Track};
use crate::error::CoreError;
use crate::types::{AnnotationId, Frame};

// ---------------------------------------------------------------------------
// Import policy
// ---------------------------------------------------------------------------

/// How an uploaded mask-and-track package reconciles with existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskImportPolicy {
    /// Drop existing masks of the incoming tracks and replace all tracks.
    Replace,
    /// Last write wins per frame for images; tracks merged by frame.
    Merge,
    /// Tracks merged by frame; existing images are never deleted.
    Additive,
}

const VALID_POLICY_STRINGS: &[&str] = &["replace", "merge", "additive"];

impl MaskImportPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::Additive => "additive",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "replace" => Ok(Self::Replace),
            "merge" => Ok(Self::Merge),
            "additive" => Ok(Self::Additive),
            _ => Err(CoreError::Validation(format!(
                "Invalid mask import policy '{s}'. Must be one of: {}",
                VALID_POLICY_STRINGS.join(", ")
            ))),
        }
    }

    /// Whether an incoming image may delete an existing image of the same
    /// frame.
    pub fn overwrites_images(&self) -> bool {
        !matches!(self, Self::Additive)
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two feature lists keyed by frame; `new` wins on shared frames.
///
/// The result keeps insertion order: frames of `old` in their original
/// order (with `new` values substituted where shared), then frames only in
/// `new`. It is not re-sorted.
pub fn merge_features(old: &[Feature], new: &[Feature]) -> Vec<Feature> {
    let mut by_frame: IndexMap<Frame, Feature> = IndexMap::with_capacity(old.len() + new.len());
    for f in old {
        by_frame.insert(f.frame, f.clone());
    }
    for f in new {
        by_frame.insert(f.frame, f.clone());
    }
    by_frame.into_values().collect()
}

/// Merge an incoming track into an existing one with the same id.
///
/// Features are merged with [`merge_features`] and sorted by frame; the span
/// becomes the union of both spans. Incoming confidence pairs replace the
/// existing ones unless empty; attributes are unioned with incoming values
/// winning.
pub fn merge_tracks(old: &Track, new: &Track) -> Track {
    let mut features = merge_features(&old.features, &new.features);
    features.sort_by_key(|f| f.frame);

    let mut attributes = old.attributes.clone();
    for (k, v) in &new.attributes {
        attributes.insert(k.clone(), v.clone());
    }

    let confidence_pairs = if new.confidence_pairs.is_empty() {
        old.confidence_pairs.clone()
    } else {
        new.confidence_pairs.clone()
    };

    Track {
        id: new.id,
        begin: old.begin.min(new.begin),
        end: old.end.max(new.end),
        confidence_pairs,
        attributes,
        features,
    }
}

/// Merge an incoming track set into an existing one.
///
/// Tracks only in `old` are carried forward unchanged; tracks only in `new`
/// are taken as-is; shared ids go through [`merge_tracks`].
pub fn merge_track_sets(
    old: &BTreeMap<AnnotationId, Track>,
    new: &BTreeMap<AnnotationId, Track>,
) -> BTreeMap<AnnotationId, Track> {
    let mut merged = old.clone();
    for (id, incoming) in new {
        let track = match old.get(id) {
            Some(existing) => merge_tracks(existing, incoming),
            None => incoming.clone(),
        };
        merged.insert(*id, track);
    }
    merged
}
