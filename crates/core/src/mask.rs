//! Mask keys, mask image decoding and the aggregate RLE index document.

use std::collections::BTreeMap;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::rle::{BinaryMask, Rle};
use crate::types::{AnnotationId, Frame};

/// Frame sentinel meaning "every frame of the track".
pub const WHOLE_TRACK: Frame = -1;

/// A `(track, frame)` mask address. `frame_id == WHOLE_TRACK` addresses the
/// whole track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskPair {
    pub track_id: AnnotationId,
    pub frame_id: Frame,
}

impl MaskPair {
    pub fn new(track_id: AnnotationId, frame_id: Frame) -> Self {
        Self { track_id, frame_id }
    }

    pub fn whole_track(track_id: AnnotationId) -> Self {
        Self {
            track_id,
            frame_id: WHOLE_TRACK,
        }
    }

    pub fn is_whole_track(&self) -> bool {
        self.frame_id == WHOLE_TRACK
    }

    /// Reject negative ids and frames other than the whole-track sentinel.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.track_id < 0 {
            return Err(CoreError::Validation(format!(
                "mask track id must be non-negative, got {}",
                self.track_id
            )));
        }
        if self.frame_id < WHOLE_TRACK {
            return Err(CoreError::Validation(format!(
                "mask frame id must be >= 0 (or {WHOLE_TRACK} for the whole track), got {}",
                self.frame_id
            )));
        }
        Ok(())
    }
}

/// File name a frame's mask image is stored under inside its track folder.
pub fn mask_file_name(frame_id: Frame) -> String {
    format!("{frame_id}.png")
}

// ---------------------------------------------------------------------------
// Image decoding
// ---------------------------------------------------------------------------

/// Decode image bytes (PNG) into a binary mask.
///
/// A cell is set when its luminance is nonzero and it is not fully
/// transparent.
pub fn decode_mask_image(bytes: &[u8]) -> Result<BinaryMask, CoreError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| CoreError::Validation(format!("mask image could not be decoded: {e}")))?;
    let gray = img.to_luma_alpha8();
    let (width, height) = gray.dimensions();
    let data = gray
        .pixels()
        .map(|p| u8::from(p.0[0] > 0 && p.0[1] > 0))
        .collect();
    BinaryMask::new(height, width, data)
}

/// Encode a binary mask as an 8-bit grayscale PNG (set cells = 255).
pub fn encode_mask_png(mask: &BinaryMask) -> Result<Vec<u8>, CoreError> {
    let raw: Vec<u8> = mask.as_slice().iter().map(|&v| v * 255).collect();
    let img = image::GrayImage::from_raw(mask.width(), mask.height(), raw)
        .ok_or_else(|| CoreError::Internal("mask buffer does not match its dimensions".into()))?;
    let mut bytes = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| CoreError::Internal(format!("mask PNG encoding failed: {e}")))?;
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// RLE index
// ---------------------------------------------------------------------------

/// One frame's entry in the RLE index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RleEntry {
    pub rle: Rle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Per-dataset aggregate of every stored mask, keyed by stringified track id
/// then stringified frame id.
///
/// Derived from the stored mask images; reconciliation rebuilds it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RleIndex(BTreeMap<String, BTreeMap<String, RleEntry>>);

impl RleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::StorageIo(format!("RLE index is not valid JSON: {e}")))
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self)
            .map_err(|e| CoreError::Internal(format!("RLE index serialization failed: {e}")))
    }

    pub fn get(&self, track_id: AnnotationId, frame_id: Frame) -> Option<&RleEntry> {
        self.0
            .get(&track_id.to_string())
            .and_then(|frames| frames.get(&frame_id.to_string()))
    }

    pub fn insert(&mut self, track_id: AnnotationId, frame_id: Frame, entry: RleEntry) {
        self.0
            .entry(track_id.to_string())
            .or_default()
            .insert(frame_id.to_string(), entry);
    }

    /// Remove one frame; drops the track key once it has no frames left.
    pub fn remove_frame(&mut self, track_id: AnnotationId, frame_id: Frame) -> bool {
        let key = track_id.to_string();
        let Some(frames) = self.0.get_mut(&key) else {
            return false;
        };
        let removed = frames.remove(&frame_id.to_string()).is_some();
        if frames.is_empty() {
            self.0.remove(&key);
        }
        removed
    }

    pub fn remove_track(&mut self, track_id: AnnotationId) -> bool {
        self.0.remove(&track_id.to_string()).is_some()
    }

    /// Every `(track, frame)` pair present, skipping keys that are not
    /// integers.
    pub fn pairs(&self) -> Vec<MaskPair> {
        let mut pairs: Vec<MaskPair> = self
            .0
            .iter()
            .filter_map(|(track, frames)| track.parse().ok().map(|t| (t, frames)))
            .flat_map(|(track_id, frames)| {
                frames
                    .keys()
                    .filter_map(move |f| f.parse().ok().map(|frame_id| MaskPair::new(track_id, frame_id)))
            })
            .collect();
        pairs.sort();
        pairs
    }

    /// Number of frame entries across all tracks.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, BTreeMap<String, RleEntry>> {
        &self.0
    }
}
