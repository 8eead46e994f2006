//! DIVE JSON annotation documents (import and export).
//!
//! Version 2 is `{ "tracks": {id: Track}, "groups": {id: Group}, "version": 2 }`.
//! Version 1 files are a bare `{id: Track}` map with no groups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::annotation::{AnnotationKind, Group, Track};
use crate::error::CoreError;

/// Current document version written on export.
pub const DIVE_JSON_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiveJson {
    #[serde(default)]
    pub tracks: BTreeMap<String, Track>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
    pub version: u32,
}

impl DiveJson {
    /// Build a current-version document keyed by stringified ids.
    pub fn new(
        tracks: impl IntoIterator<Item = Track>,
        groups: impl IntoIterator<Item = Group>,
    ) -> Self {
        Self {
            tracks: tracks.into_iter().map(|t| (t.id.to_string(), t)).collect(),
            groups: groups.into_iter().map(|g| (g.id.to_string(), g)).collect(),
            version: DIVE_JSON_VERSION,
        }
    }

    pub fn into_annotations(self) -> (Vec<Track>, Vec<Group>) {
        (
            self.tracks.into_values().collect(),
            self.groups.into_values().collect(),
        )
    }
}

/// Parse and validate a DIVE JSON document of either version.
pub fn parse_dive_json(value: serde_json::Value) -> Result<DiveJson, CoreError> {
    let obj = value
        .as_object()
        .ok_or_else(|| CoreError::Validation("DIVE JSON must be an object".to_string()))?;

    let doc = if obj.contains_key("version") {
        let doc: DiveJson = serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("Malformed DIVE JSON: {e}")))?;
        if doc.version == 0 || doc.version > DIVE_JSON_VERSION {
            return Err(CoreError::Validation(format!(
                "Unsupported DIVE JSON version {}",
                doc.version
            )));
        }
        doc
    } else {
        let tracks: BTreeMap<String, Track> = serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("Malformed version 1 DIVE JSON: {e}")))?;
        DiveJson {
            tracks,
            groups: BTreeMap::new(),
            version: 1,
        }
    };

    check_entries(&doc.tracks)?;
    check_entries(&doc.groups)?;
    Ok(doc)
}

fn check_entries<K: AnnotationKind>(entries: &BTreeMap<String, K>) -> Result<(), CoreError> {
    for (key, annotation) in entries {
        if key.parse::<i64>().ok() != Some(annotation.id()) {
            return Err(CoreError::Validation(format!(
                "{} key '{key}' does not match its id {}",
                K::ENTITY,
                annotation.id()
            )));
        }
        annotation.validate()?;
    }
    Ok(())
}
