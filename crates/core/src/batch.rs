//! Inbound upsert/delete batches and save options.
//!
//! Wire shape: `{ tracks: { delete: [id], upsert: [Track] }, groups: { ... } }`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::annotation::{AnnotationKind, Group, Track};
use crate::error::CoreError;
use crate::types::AnnotationId;

/// Deletions and upserts of one annotation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: Deserialize<'de>"))]
pub struct KindBatch<K> {
    #[serde(default)]
    pub delete: Vec<AnnotationId>,
    #[serde(default)]
    pub upsert: Vec<K>,
}

impl<K> Default for KindBatch<K> {
    fn default() -> Self {
        Self {
            delete: Vec::new(),
            upsert: Vec::new(),
        }
    }
}

impl<K: AnnotationKind> KindBatch<K> {
    pub fn upsert(annotations: Vec<K>) -> Self {
        Self {
            delete: Vec::new(),
            upsert: annotations,
        }
    }

    pub fn delete(ids: Vec<AnnotationId>) -> Self {
        Self {
            delete: ids,
            upsert: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.upsert.is_empty()
    }

    /// Validate every upserted object and the id lists.
    ///
    /// Nothing is written when this fails.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = BTreeSet::new();
        for annotation in &self.upsert {
            annotation.validate()?;
            if !seen.insert(annotation.id()) {
                return Err(CoreError::Validation(format!(
                    "{} {} appears more than once in one upsert batch",
                    K::ENTITY,
                    annotation.id()
                )));
            }
        }
        if let Some(bad) = self.delete.iter().find(|&&id| id < 0) {
            return Err(CoreError::Validation(format!(
                "{} delete id must be non-negative, got {bad}",
                K::ENTITY
            )));
        }
        Ok(())
    }

    /// Delete ids that are not also upserted in this batch, de-duplicated.
    pub fn effective_deletes(&self) -> Vec<AnnotationId> {
        let upserted: BTreeSet<AnnotationId> = self.upsert.iter().map(|a| a.id()).collect();
        let deletes: BTreeSet<AnnotationId> = self
            .delete
            .iter()
            .copied()
            .filter(|id| !upserted.contains(id))
            .collect();
        deletes.into_iter().collect()
    }
}

/// A track and group batch submitted in one save call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationBatch {
    #[serde(default)]
    pub tracks: KindBatch<Track>,
    #[serde(default)]
    pub groups: KindBatch<Group>,
}

impl AnnotationBatch {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.tracks.validate()?;
        self.groups.validate()
    }
}

/// Flags and log metadata for one save call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaveOptions {
    /// Soft-delete every live record of each kind before inserting.
    #[serde(default)]
    pub overwrite: bool,
    /// Write records without appending a revision log entry.
    #[serde(default)]
    pub prevent_revision: bool,
    #[serde(default)]
    #[validate(length(max = 1024))]
    pub description: String,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub author: String,
}

impl SaveOptions {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn check(&self) -> Result<(), CoreError> {
        Validate::validate(self).map_err(|e| CoreError::Validation(e.to_string()))
    }
}
