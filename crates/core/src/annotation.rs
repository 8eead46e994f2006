//! Track and group annotation model and shape validation.
//!
//! Tracks and groups share one versioned persistence algorithm; the
//! [`AnnotationKind`] trait is the seam that lets storage code stay generic
//! over both.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{AnnotationId, Frame};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sub-frame time units per frame (`flick = frame * FLICKS_PER_FRAME`).
pub const FLICKS_PER_FRAME: i64 = 100_000;

/// Free-form attribute map attached to tracks, groups and features.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A `(label, confidence)` pair, serialized as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidencePair(pub String, pub f64);

impl ConfidencePair {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self(label.into(), confidence)
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn confidence(&self) -> f64 {
        self.1
    }
}

/// A single per-frame detection of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub frame: Frame,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flick: Option<i64>,
    /// `[x1, y1, x2, y2]`
    pub bounds: [i64; 4],
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_mask: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyframe: Option<bool>,
}

impl Feature {
    /// A keyframe feature at `frame` with its flick derived from the frame.
    pub fn new(frame: Frame, bounds: [i64; 4]) -> Self {
        Self {
            frame,
            flick: Some(frame * FLICKS_PER_FRAME),
            bounds,
            attributes: Attributes::new(),
            geometry: None,
            has_mask: None,
            interpolate: None,
            keyframe: Some(true),
        }
    }
}

/// A labeled object instance with a time-ordered sequence of detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: AnnotationId,
    pub begin: Frame,
    pub end: Frame,
    #[serde(default)]
    pub confidence_pairs: Vec<ConfidencePair>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl Track {
    /// Build a track whose `begin`/`end` span the given features.
    ///
    /// An empty feature list yields `begin = end = 0`.
    pub fn from_features(
        id: AnnotationId,
        confidence_pairs: Vec<ConfidencePair>,
        features: Vec<Feature>,
    ) -> Self {
        let begin = features.first().map(|f| f.frame).unwrap_or(0);
        let end = features.last().map(|f| f.frame).unwrap_or(0);
        Self {
            id,
            begin,
            end,
            confidence_pairs,
            attributes: Attributes::new(),
            features,
        }
    }
}

/// Frame ranges over which one track belongs to a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub ranges: Vec<[Frame; 2]>,
}

/// A labeled association of multiple tracks over specific frame ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: AnnotationId,
    pub begin: Frame,
    pub end: Frame,
    #[serde(default)]
    pub confidence_pairs: Vec<ConfidencePair>,
    #[serde(default)]
    pub attributes: Attributes,
    /// Keyed by stringified track id.
    #[serde(default)]
    pub members: BTreeMap<String, GroupMember>,
}

// ---------------------------------------------------------------------------
// Kind seam
// ---------------------------------------------------------------------------

/// Behaviour shared by every versioned annotation kind.
pub trait AnnotationKind:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
    /// Entity name used in errors and log fields.
    const ENTITY: &'static str;

    fn id(&self) -> AnnotationId;
    fn begin(&self) -> Frame;
    fn end(&self) -> Frame;
    fn confidence_pairs(&self) -> &[ConfidencePair];

    /// Reject objects that do not conform to the stored shape.
    fn validate(&self) -> Result<(), CoreError>;
}

impl AnnotationKind for Track {
    const ENTITY: &'static str = "Track";

    fn id(&self) -> AnnotationId {
        self.id
    }
    fn begin(&self) -> Frame {
        self.begin
    }
    fn end(&self) -> Frame {
        self.end
    }
    fn confidence_pairs(&self) -> &[ConfidencePair] {
        &self.confidence_pairs
    }
    fn validate(&self) -> Result<(), CoreError> {
        validate_track(self)
    }
}

impl AnnotationKind for Group {
    const ENTITY: &'static str = "Group";

    fn id(&self) -> AnnotationId {
        self.id
    }
    fn begin(&self) -> Frame {
        self.begin
    }
    fn end(&self) -> Frame {
        self.end
    }
    fn confidence_pairs(&self) -> &[ConfidencePair] {
        &self.confidence_pairs
    }
    fn validate(&self) -> Result<(), CoreError> {
        validate_group(self)
    }
}

// ---------------------------------------------------------------------------
// Validation functions
// ---------------------------------------------------------------------------

fn validate_common(
    entity: &str,
    id: AnnotationId,
    begin: Frame,
    end: Frame,
    pairs: &[ConfidencePair],
) -> Result<(), CoreError> {
    if id < 0 {
        return Err(CoreError::Validation(format!(
            "{entity} id must be a non-negative integer, got {id}"
        )));
    }
    if begin < 0 || begin > end {
        return Err(CoreError::Validation(format!(
            "{entity} {id}: begin ({begin}) must be >= 0 and <= end ({end})"
        )));
    }
    for (i, pair) in pairs.iter().enumerate() {
        if pair.label().trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "{entity} {id}: confidencePairs[{i}] has an empty label"
            )));
        }
        let c = pair.confidence();
        if !c.is_finite() || !(0.0..=1.0).contains(&c) {
            return Err(CoreError::Validation(format!(
                "{entity} {id}: confidencePairs[{i}] confidence must be within [0, 1], got {c}"
            )));
        }
    }
    Ok(())
}

/// Validate a track's shape.
///
/// Features must be strictly ascending by frame, the first feature must sit
/// on `begin` and the last on `end`, and each bounding box must be ordered.
pub fn validate_track(track: &Track) -> Result<(), CoreError> {
    validate_common(
        Track::ENTITY,
        track.id,
        track.begin,
        track.end,
        &track.confidence_pairs,
    )?;

    let id = track.id;
    if let (Some(first), Some(last)) = (track.features.first(), track.features.last()) {
        if first.frame != track.begin {
            return Err(CoreError::Validation(format!(
                "Track {id}: features[0].frame ({}) must equal begin ({})",
                first.frame, track.begin
            )));
        }
        if last.frame != track.end {
            return Err(CoreError::Validation(format!(
                "Track {id}: features[-1].frame ({}) must equal end ({})",
                last.frame, track.end
            )));
        }
    }

    for (i, pair) in track.features.windows(2).enumerate() {
        if pair[1].frame <= pair[0].frame {
            return Err(CoreError::Validation(format!(
                "Track {id}: features must be strictly ascending by frame \
                 (features[{}].frame = {} follows {})",
                i + 1,
                pair[1].frame,
                pair[0].frame
            )));
        }
    }

    for (i, feature) in track.features.iter().enumerate() {
        let [x1, y1, x2, y2] = feature.bounds;
        if x1 > x2 || y1 > y2 {
            return Err(CoreError::Validation(format!(
                "Track {id}: features[{i}].bounds {:?} must be ordered as [x1, y1, x2, y2]",
                feature.bounds
            )));
        }
    }

    Ok(())
}

/// Validate a group's shape. Member keys must be track ids.
pub fn validate_group(group: &Group) -> Result<(), CoreError> {
    validate_common(
        Group::ENTITY,
        group.id,
        group.begin,
        group.end,
        &group.confidence_pairs,
    )?;

    let id = group.id;
    for (key, member) in &group.members {
        match key.parse::<AnnotationId>() {
            Ok(track_id) if track_id >= 0 => {}
            _ => {
                return Err(CoreError::Validation(format!(
                    "Group {id}: member key '{key}' is not a track id"
                )))
            }
        }
        for range in &member.ranges {
            if range[0] > range[1] {
                return Err(CoreError::Validation(format!(
                    "Group {id}: member '{key}' has an inverted range {range:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Parse an annotation from untyped JSON, mapping shape errors to validation
/// failures.
pub fn parse_annotation<K: AnnotationKind>(value: serde_json::Value) -> Result<K, CoreError> {
    let annotation: K = serde_json::from_value(value)
        .map_err(|e| CoreError::Validation(format!("Malformed {}: {e}", K::ENTITY)))?;
    annotation.validate()?;
    Ok(annotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn track(features: Vec<Feature>) -> Track {
        Track::from_features(1, vec![ConfidencePair::new("fish", 0.9)], features)
    }

    #[test]
    fn valid_track_passes() {
        let t = track(vec![
            Feature::new(0, [0, 0, 10, 10]),
            Feature::new(1, [1, 1, 11, 11]),
            Feature::new(2, [2, 2, 12, 12]),
        ]);
        assert!(validate_track(&t).is_ok());
    }

    #[test]
    fn track_without_features_passes() {
        let mut t = track(vec![]);
        t.begin = 3;
        t.end = 9;
        assert!(validate_track(&t).is_ok());
    }

    #[test]
    fn first_feature_must_match_begin() {
        let mut t = track(vec![Feature::new(1, [0, 0, 1, 1]), Feature::new(2, [0, 0, 1, 1])]);
        t.begin = 0;
        let msg = validate_track(&t).unwrap_err().to_string();
        assert!(msg.contains("features[0].frame"));
    }

    #[test]
    fn last_feature_must_match_end() {
        let mut t = track(vec![Feature::new(0, [0, 0, 1, 1]), Feature::new(2, [0, 0, 1, 1])]);
        t.end = 5;
        let msg = validate_track(&t).unwrap_err().to_string();
        assert!(msg.contains("features[-1].frame"));
    }

    #[test]
    fn unsorted_features_rejected() {
        let mut t = track(vec![Feature::new(0, [0, 0, 1, 1]), Feature::new(0, [0, 0, 1, 1])]);
        t.end = 0;
        assert!(validate_track(&t).is_err());
    }

    #[test]
    fn negative_id_rejected() {
        let mut t = track(vec![Feature::new(0, [0, 0, 1, 1])]);
        t.id = -1;
        assert!(validate_track(&t).is_err());
    }

    #[test]
    fn inverted_bounds_rejected() {
        let t = track(vec![Feature::new(0, [10, 0, 1, 1])]);
        assert!(validate_track(&t).is_err());
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let mut t = track(vec![Feature::new(0, [0, 0, 1, 1])]);
        t.confidence_pairs = vec![ConfidencePair::new("fish", 1.5)];
        assert!(validate_track(&t).is_err());
    }

    #[test]
    fn group_member_keys_must_be_ids() {
        let mut members = BTreeMap::new();
        members.insert("abc".to_string(), GroupMember { ranges: vec![[0, 1]] });
        let g = Group {
            id: 0,
            begin: 0,
            end: 1,
            confidence_pairs: vec![],
            attributes: Attributes::new(),
            members,
        };
        assert!(validate_group(&g).is_err());
    }

    #[test]
    fn group_inverted_range_rejected() {
        let mut members = BTreeMap::new();
        members.insert("4".to_string(), GroupMember { ranges: vec![[5, 1]] });
        let g = Group {
            id: 0,
            begin: 0,
            end: 5,
            confidence_pairs: vec![],
            attributes: Attributes::new(),
            members,
        };
        assert!(validate_group(&g).is_err());
    }

    #[test]
    fn parse_rejects_non_integer_id() {
        let value = json!({"id": 1.5, "begin": 0, "end": 0, "features": []});
        let err = parse_annotation::<Track>(value).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn parse_accepts_dive_shaped_json() {
        let value = json!({
            "id": 7,
            "begin": 0,
            "end": 1,
            "confidencePairs": [["fish", 0.75]],
            "attributes": {},
            "features": [
                {"frame": 0, "bounds": [0, 0, 5, 5], "keyframe": true},
                {"frame": 1, "bounds": [1, 1, 6, 6], "interpolate": true}
            ]
        });
        let t: Track = parse_annotation(value).unwrap();
        assert_eq!(t.id, 7);
        assert_eq!(t.confidence_pairs[0].label(), "fish");
        assert_eq!(t.features[1].interpolate, Some(true));
    }

    #[test]
    fn confidence_pair_serializes_as_array() {
        let v = serde_json::to_value(ConfidencePair::new("a", 0.5)).unwrap();
        assert_eq!(v, json!(["a", 0.5]));
    }

    #[test]
    fn feature_new_derives_flick() {
        assert_eq!(Feature::new(3, [0, 0, 1, 1]).flick, Some(300_000));
    }
}
