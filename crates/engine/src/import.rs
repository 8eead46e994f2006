//! Mask-and-track package imports, e.g. the output of an external
//! segmentation job.

use std::collections::{BTreeMap, BTreeSet};

use dive_core::annotation::{Group, Track};
use dive_core::batch::{AnnotationBatch, KindBatch, SaveOptions};
use dive_core::error::CoreError;
use dive_core::mask::{decode_mask_image, MaskPair};
use dive_core::merge::{merge_track_sets, MaskImportPolicy};
use dive_core::types::{AnnotationId, DbId, Frame, Revision};
use serde::Serialize;

use crate::store::Store;
use crate::versioning::ListParams;
use crate::Engine;

/// One mask image of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskImage {
    pub track_id: AnnotationId,
    pub frame_id: Frame,
    pub bytes: Vec<u8>,
}

impl MaskImage {
    pub fn pair(&self) -> MaskPair {
        MaskPair::new(self.track_id, self.frame_id)
    }
}

/// Tracks, groups and mask images delivered together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskPackage {
    pub tracks: Vec<Track>,
    pub groups: Vec<Group>,
    pub images: Vec<MaskImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub policy: MaskImportPolicy,
    pub images_stored: usize,
    /// Stored images that took the place of an existing image.
    pub images_replaced: usize,
    /// Images left out because the frame already had one (additive only).
    pub images_skipped: Vec<MaskPair>,
    pub tracks_written: u64,
    pub revision: Option<Revision>,
}

impl MaskPackage {
    /// Reject the package before anything is written.
    fn validate(&self) -> Result<(), CoreError> {
        KindBatch::upsert(self.tracks.clone()).validate()?;
        KindBatch::upsert(self.groups.clone()).validate()?;

        let mut seen = BTreeSet::new();
        for image in &self.images {
            let pair = image.pair();
            pair.validate()?;
            if pair.is_whole_track() {
                return Err(CoreError::Validation(format!(
                    "mask image for track {} needs a concrete frame id",
                    pair.track_id
                )));
            }
            if !seen.insert(pair) {
                return Err(CoreError::Validation(format!(
                    "mask image for track {} frame {} appears more than once",
                    pair.track_id, pair.frame_id
                )));
            }
            decode_mask_image(&image.bytes)?;
        }
        Ok(())
    }

    fn image_tracks(&self) -> Vec<MaskPair> {
        let tracks: BTreeSet<AnnotationId> = self.images.iter().map(|i| i.track_id).collect();
        tracks.into_iter().map(MaskPair::whole_track).collect()
    }
}

impl<S: Store> Engine<S> {
    /// Bring a package into the dataset under `policy`.
    ///
    /// `Replace` drops the masks of every track the package has images for
    /// and replaces all tracks and groups. `Merge` and `Additive` merge
    /// incoming tracks into existing ones frame by frame and keep tracks the
    /// package does not mention; `Merge` replaces colliding images while
    /// `Additive` keeps the existing ones.
    pub async fn import_mask_package(
        &self,
        dataset_id: DbId,
        package: MaskPackage,
        policy: MaskImportPolicy,
    ) -> Result<ImportReport, CoreError> {
        package.validate()?;
        self.datasets.find_dataset(dataset_id).await?;

        let image_tracks = package.image_tracks();
        let MaskPackage {
            tracks,
            groups,
            images,
        } = package;

        let batch = match policy {
            MaskImportPolicy::Replace => AnnotationBatch {
                tracks: KindBatch::upsert(tracks),
                groups: KindBatch::upsert(groups),
            },
            MaskImportPolicy::Merge | MaskImportPolicy::Additive => {
                let existing: BTreeMap<AnnotationId, Track> = self
                    .versioning
                    .list::<Track>(dataset_id, &ListParams::default())
                    .await?
                    .into_iter()
                    .map(|t| (t.id, t))
                    .collect();
                let incoming: BTreeMap<AnnotationId, Track> =
                    tracks.into_iter().map(|t| (t.id, t)).collect();
                let upserts = merge_track_sets(&existing, &incoming)
                    .into_iter()
                    .filter(|(id, _)| incoming.contains_key(id))
                    .map(|(_, t)| t)
                    .collect();
                AnnotationBatch {
                    tracks: KindBatch::upsert(upserts),
                    groups: KindBatch::upsert(groups),
                }
            }
        };
        let options = SaveOptions {
            overwrite: policy == MaskImportPolicy::Replace,
            description: format!("Mask package import ({})", policy.as_str()),
            ..SaveOptions::default()
        };
        let saved = self.versioning.save(dataset_id, &batch, &options).await?;

        if policy == MaskImportPolicy::Replace && !image_tracks.is_empty() {
            self.masks.delete_masks(dataset_id, &image_tracks).await?;
        }

        let mut report = ImportReport {
            policy,
            images_stored: 0,
            images_replaced: 0,
            images_skipped: Vec::new(),
            tracks_written: saved.updated,
            revision: saved.revision,
        };
        for image in images {
            let pair = image.pair();
            if !policy.overwrites_images()
                && self
                    .masks
                    .has_image(dataset_id, pair.track_id, pair.frame_id)
                    .await?
            {
                report.images_skipped.push(pair);
                continue;
            }
            let (_, replaced) = self
                .masks
                .write_image(dataset_id, pair.track_id, pair.frame_id, image.bytes)
                .await?;
            report.images_stored += 1;
            if replaced {
                report.images_replaced += 1;
            }
        }

        if !image_tracks.is_empty() {
            self.masks
                .update_rle_masks(dataset_id, Some(image_tracks.as_slice()))
                .await?;
        }

        tracing::info!(
            dataset_id,
            policy = policy.as_str(),
            stored = report.images_stored,
            replaced = report.images_replaced,
            skipped = report.images_skipped.len(),
            tracks_written = report.tracks_written,
            "Mask package imported",
        );
        Ok(report)
    }
}
