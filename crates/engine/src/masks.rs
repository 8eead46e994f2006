//! Mask frame storage and the per-dataset RLE index.
//!
//! Mask images live in the blob store under a fresh key per upload; the
//! [`MaskItemStore`](crate::store::MaskItemStore) maps each
//! (dataset, track, frame) to its current key. The RLE index is derived from
//! those images and rebuilt by [`MaskService::update_rle_masks`].

use std::sync::Arc;

use dive_core::error::CoreError;
use dive_core::mask::{decode_mask_image, MaskPair, RleEntry, RleIndex};
use dive_core::rle;
use dive_core::types::{AnnotationId, DbId, Frame};
use dive_db::models::mask_item::MaskFrameItem;
use futures::StreamExt;
use serde::Serialize;

use crate::blob::{mask_blob_key, rle_index_key, BlobStore};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Per-pair outcome of [`MaskService::delete_masks`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMasksResult {
    /// Whole-track deletions that removed at least one frame.
    pub tracks_deleted: Vec<AnnotationId>,
    /// Whole-track deletions that found no frames.
    pub tracks_not_found: Vec<AnnotationId>,
    pub frames_deleted: Vec<MaskPair>,
    pub frames_not_found: Vec<MaskPair>,
    /// Frame items removed in total, across both kinds of deletion.
    pub items_removed: usize,
}

impl DeleteMasksResult {
    pub fn deleted_anything(&self) -> bool {
        self.items_removed > 0
    }

    /// Pairs whose index entries must be reconciled.
    fn touched_pairs(&self) -> Vec<MaskPair> {
        self.tracks_deleted
            .iter()
            .map(|&t| MaskPair::whole_track(t))
            .chain(self.frames_deleted.iter().copied())
            .collect()
    }
}

/// Outcome of one index reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub index: RleIndex,
    /// Frames freshly encoded into the index.
    pub encoded: usize,
    /// Frames in scope left out of the index because they have no readable
    /// image.
    pub skipped: Vec<MaskPair>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MaskService<S> {
    store: S,
    blobs: Arc<dyn BlobStore>,
    concurrency: usize,
}

impl<S: Store> MaskService<S> {
    pub fn new(store: S, blobs: Arc<dyn BlobStore>, concurrency: usize) -> Self {
        Self {
            store,
            blobs,
            concurrency: concurrency.max(1),
        }
    }

    /// Ensure a frame item exists with no image attached, dropping any image
    /// it held before.
    pub async fn get_or_create_mask_item(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<MaskFrameItem, CoreError> {
        let pair = MaskPair::new(track_id, frame_id);
        pair.validate()?;
        if pair.is_whole_track() {
            return Err(CoreError::Validation(
                "a mask frame item needs a concrete frame id".into(),
            ));
        }

        let (item, previous) = self
            .store
            .get_or_create_mask_item(dataset_id, track_id, frame_id)
            .await?;
        if let Some(key) = previous {
            self.discard_blob(&key).await;
        }
        Ok(item)
    }

    /// Store one frame's mask image and bring its index entry up to date.
    pub async fn upload_mask(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
        bytes: Vec<u8>,
    ) -> Result<MaskFrameItem, CoreError> {
        decode_mask_image(&bytes)?;
        let (item, _) = self.write_image(dataset_id, track_id, frame_id, bytes).await?;
        self.update_rle_masks(dataset_id, Some(std::slice::from_ref(&item.pair())))
            .await?;
        Ok(item)
    }

    /// Write image bytes for a frame without touching the index. Returns the
    /// item and whether it already had an image.
    pub(crate) async fn write_image(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
        bytes: Vec<u8>,
    ) -> Result<(MaskFrameItem, bool), CoreError> {
        let replaced = self
            .store
            .find_mask_item(dataset_id, track_id, frame_id)
            .await?
            .is_some_and(|item| item.blob_key.is_some());

        let item = self
            .get_or_create_mask_item(dataset_id, track_id, frame_id)
            .await?;
        let key = mask_blob_key(dataset_id, track_id, frame_id);
        self.blobs.put(&key, bytes).await?;
        let item = self.store.set_mask_blob(item.id, &key).await?;
        Ok((item, replaced))
    }

    /// Whether the frame currently has an image.
    pub(crate) async fn has_image(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Result<bool, CoreError> {
        Ok(self
            .store
            .find_mask_item(dataset_id, track_id, frame_id)
            .await?
            .is_some_and(|item| item.blob_key.is_some()))
    }

    /// Delete masks by pair. `frame_id == -1` removes every frame of the
    /// track. Missing items are reported, not treated as errors. The index is
    /// reconciled for whatever was removed.
    pub async fn delete_masks(
        &self,
        dataset_id: DbId,
        pairs: &[MaskPair],
    ) -> Result<DeleteMasksResult, CoreError> {
        for pair in pairs {
            pair.validate()?;
        }

        let mut result = DeleteMasksResult::default();
        for pair in pairs {
            if pair.is_whole_track() {
                let removed = self
                    .store
                    .delete_mask_track(dataset_id, pair.track_id)
                    .await?;
                if removed.is_empty() {
                    result.tracks_not_found.push(pair.track_id);
                } else {
                    result.items_removed += removed.len();
                    result.tracks_deleted.push(pair.track_id);
                    self.discard_item_blobs(&removed).await;
                }
            } else {
                match self
                    .store
                    .delete_mask_frame(dataset_id, pair.track_id, pair.frame_id)
                    .await?
                {
                    Some(item) => {
                        result.items_removed += 1;
                        result.frames_deleted.push(*pair);
                        self.discard_item_blobs(std::slice::from_ref(&item)).await;
                    }
                    None => result.frames_not_found.push(*pair),
                }
            }
        }

        if result.deleted_anything() {
            let touched = result.touched_pairs();
            self.update_rle_masks(dataset_id, Some(touched.as_slice()))
                .await?;
        }
        tracing::info!(
            dataset_id,
            removed = result.items_removed,
            tracks_not_found = result.tracks_not_found.len(),
            frames_not_found = result.frames_not_found.len(),
            "Masks deleted",
        );
        Ok(result)
    }

    /// Remove every mask of a dataset along with its index.
    pub async fn purge_dataset(&self, dataset_id: DbId) -> Result<usize, CoreError> {
        let removed = self.store.delete_mask_items(dataset_id).await?;
        self.discard_item_blobs(&removed).await;
        self.blobs.delete(&rle_index_key(dataset_id)).await?;
        Ok(removed.len())
    }

    // ── Index ────────────────────────────────────────────────────────

    /// Recompute index entries for `pairs`, or for every stored frame when
    /// `pairs` is `None`, and persist the result.
    ///
    /// With explicit pairs the previous index is the starting point and a
    /// corrupt one is an error. `None` rebuilds from scratch, so entries
    /// without a frame item disappear.
    pub async fn update_rle_masks(
        &self,
        dataset_id: DbId,
        pairs: Option<&[MaskPair]>,
    ) -> Result<Reconciliation, CoreError> {
        let key = rle_index_key(dataset_id);

        let (mut index, mut items) = match pairs {
            None => (
                RleIndex::new(),
                self.store.list_mask_items(dataset_id, None).await?,
            ),
            Some(pairs) => {
                for pair in pairs {
                    pair.validate()?;
                }
                let mut index = self.load_index(&key).await?;
                let mut items = Vec::new();
                for pair in pairs {
                    if pair.is_whole_track() {
                        index.remove_track(pair.track_id);
                        items.extend(
                            self.store
                                .list_mask_items(dataset_id, Some(pair.track_id))
                                .await?,
                        );
                    } else {
                        index.remove_frame(pair.track_id, pair.frame_id);
                        if let Some(item) = self
                            .store
                            .find_mask_item(dataset_id, pair.track_id, pair.frame_id)
                            .await?
                        {
                            items.push(item);
                        }
                    }
                }
                (index, items)
            }
        };
        items.sort_by_key(|i| (i.track_id, i.frame_id));
        items.dedup_by_key(|i| i.id);

        let results: Vec<(MaskPair, Result<Option<RleEntry>, CoreError>)> =
            futures::stream::iter(items)
                .map(|item| async move {
                    let pair = item.pair();
                    (pair, self.encode_item(item).await)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut encoded = 0;
        let mut skipped = Vec::new();
        for (pair, result) in results {
            match result? {
                Some(entry) => {
                    index.insert(pair.track_id, pair.frame_id, entry);
                    encoded += 1;
                }
                None => skipped.push(pair),
            }
        }
        skipped.sort();

        self.blobs.delete(&key).await?;
        self.blobs.put(&key, index.to_json_vec()?).await?;

        tracing::info!(
            dataset_id,
            full_rebuild = pairs.is_none(),
            encoded,
            skipped = skipped.len(),
            entries = index.len(),
            "RLE index reconciled",
        );
        Ok(Reconciliation {
            index,
            encoded,
            skipped,
        })
    }

    /// The dataset's RLE index, or an empty one when it is missing or
    /// unreadable.
    pub async fn get_mask_json(&self, dataset_id: DbId) -> RleIndex {
        match self.load_index(&rle_index_key(dataset_id)).await {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(dataset_id, error = %e, "RLE index unreadable; serving empty index");
                RleIndex::new()
            }
        }
    }

    /// One frame's index entry, if any.
    pub async fn get_rle_mask(
        &self,
        dataset_id: DbId,
        track_id: AnnotationId,
        frame_id: Frame,
    ) -> Option<RleEntry> {
        self.get_mask_json(dataset_id)
            .await
            .get(track_id, frame_id)
            .cloned()
    }

    async fn load_index(&self, key: &str) -> Result<RleIndex, CoreError> {
        match self.blobs.get(key).await? {
            Some(bytes) => RleIndex::from_json_slice(&bytes),
            None => Ok(RleIndex::new()),
        }
    }

    /// Decode a frame's image and run-length encode it. `Ok(None)` when the
    /// item has no usable image.
    async fn encode_item(&self, item: MaskFrameItem) -> Result<Option<RleEntry>, CoreError> {
        let pair = item.pair();
        let Some(key) = item.blob_key.as_deref() else {
            tracing::warn!(dataset_id = item.dataset_id, ?pair, "Mask item has no image; skipped");
            return Ok(None);
        };
        let Some(bytes) = self.blobs.get(key).await? else {
            tracing::warn!(dataset_id = item.dataset_id, ?pair, key, "Mask image missing; skipped");
            return Ok(None);
        };

        let encoded = tokio::task::spawn_blocking(move || {
            decode_mask_image(&bytes).map(|mask| rle::encode(&mask))
        })
        .await
        .map_err(|e| CoreError::Internal(format!("mask encoding task failed: {e}")))?;

        match encoded {
            Ok(rle) => Ok(Some(RleEntry {
                rle,
                file_name: Some(item.file_name()),
            })),
            Err(e) => {
                tracing::warn!(dataset_id = item.dataset_id, ?pair, error = %e, "Mask image undecodable; skipped");
                Ok(None)
            }
        }
    }

    async fn discard_blob(&self, key: &str) {
        if let Err(e) = self.blobs.delete(key).await {
            tracing::warn!(key, error = %e, "Failed to delete mask image");
        }
    }

    async fn discard_item_blobs(&self, items: &[MaskFrameItem]) {
        for key in items.iter().filter_map(|i| i.blob_key.as_deref()) {
            self.discard_blob(key).await;
        }
    }
}
