//! Mask items, the RLE index and its reconciliation.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{corner_png, new_dataset, solid_png, test_engine, track};
use dive_core::batch::{AnnotationBatch, KindBatch, SaveOptions};
use dive_core::error::CoreError;
use dive_core::mask::{MaskPair, RleIndex};
use dive_core::rle::{self, BinaryMask};
use dive_engine::blob::{rle_index_key, BlobStore, LocalBlobStore};
use dive_engine::config::EngineConfig;
use dive_engine::store::memory::MemoryStore;
use dive_engine::store::MaskItemStore;
use dive_engine::Engine;

async fn stored_index(t: &common::TestEngine, ds: i64) -> Option<RleIndex> {
    let bytes = t.blobs.get(&rle_index_key(ds)).await.unwrap()?;
    Some(RleIndex::from_json_slice(&bytes).unwrap())
}

#[tokio::test]
async fn uploaded_solid_mask_lands_in_index() {
    let t = test_engine();
    let ds = new_dataset(&t).await;

    t.engine.masks.upload_mask(ds, 5, 10, solid_png(4, 4)).await.unwrap();

    let index = t.engine.masks.get_mask_json(ds).await;
    let entry = index.get(5, 10).expect("entry for track 5 frame 10");
    assert_eq!(entry.rle.size, [4, 4]);
    assert_eq!(entry.rle.counts, "0`0");
    assert_eq!(entry.file_name.as_deref(), Some("10.png"));
    assert_eq!(rle::decode(&entry.rle).unwrap(), BinaryMask::filled(4, 4, true));

    let json = serde_json::to_value(&index).unwrap();
    assert_eq!(json["5"]["10"]["rle"]["size"], serde_json::json!([4, 4]));

    assert_eq!(t.engine.masks.get_rle_mask(ds, 5, 10).await, Some(entry.clone()));
    assert_eq!(t.engine.masks.get_rle_mask(ds, 5, 11).await, None);
}

#[tokio::test]
async fn full_rebuild_matches_stored_items_exactly() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let masks = &t.engine.masks;

    masks.upload_mask(ds, 1, 0, solid_png(2, 3)).await.unwrap();
    masks.upload_mask(ds, 1, 1, corner_png(2, 3)).await.unwrap();
    masks.upload_mask(ds, 2, 5, solid_png(3, 3)).await.unwrap();

    // A stale entry with no frame item behind it.
    let mut stale = masks.get_mask_json(ds).await;
    let entry = stale.get(1, 0).cloned().unwrap();
    stale.insert(9, 9, entry);
    t.blobs
        .put(&rle_index_key(ds), stale.to_json_vec().unwrap())
        .await
        .unwrap();

    let rebuilt = masks.update_rle_masks(ds, None).await.unwrap();
    assert_eq!(rebuilt.encoded, 3);
    assert!(rebuilt.skipped.is_empty());

    let items: Vec<MaskPair> = t
        .store
        .list_mask_items(ds, None)
        .await
        .unwrap()
        .iter()
        .map(|i| i.pair())
        .collect();
    assert_eq!(rebuilt.index.pairs(), items);
    assert_eq!(stored_index(&t, ds).await.unwrap(), rebuilt.index);
}

#[tokio::test]
async fn get_or_create_clears_existing_image() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let masks = &t.engine.masks;

    let uploaded = masks.upload_mask(ds, 1, 0, solid_png(2, 2)).await.unwrap();
    let old_key = uploaded.blob_key.clone().unwrap();

    let item = masks.get_or_create_mask_item(ds, 1, 0).await.unwrap();
    assert_eq!(item.id, uploaded.id);
    assert!(item.blob_key.is_none());
    assert_eq!(t.blobs.get(&old_key).await.unwrap(), None);

    assert_matches!(
        masks.get_or_create_mask_item(ds, 1, -1).await,
        Err(CoreError::Validation(_))
    );
}

#[tokio::test]
async fn delete_masks_reports_found_and_missing() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let masks = &t.engine.masks;

    masks.upload_mask(ds, 1, 0, solid_png(2, 2)).await.unwrap();
    masks.upload_mask(ds, 1, 1, solid_png(2, 2)).await.unwrap();
    masks.upload_mask(ds, 2, 0, solid_png(2, 2)).await.unwrap();

    let result = masks
        .delete_masks(
            ds,
            &[
                MaskPair::whole_track(1),
                MaskPair::whole_track(3),
                MaskPair::new(2, 0),
                MaskPair::new(2, 7),
            ],
        )
        .await
        .unwrap();

    assert_eq!(result.tracks_deleted, vec![1]);
    assert_eq!(result.tracks_not_found, vec![3]);
    assert_eq!(result.frames_deleted, vec![MaskPair::new(2, 0)]);
    assert_eq!(result.frames_not_found, vec![MaskPair::new(2, 7)]);
    assert_eq!(result.items_removed, 3);

    assert!(t.store.list_mask_items(ds, None).await.unwrap().is_empty());
    assert!(masks.get_mask_json(ds).await.is_empty());
    // Only the index document is left.
    assert_eq!(t.blobs.keys().await, vec![rle_index_key(ds)]);
}

#[tokio::test]
async fn deleting_nothing_leaves_index_untouched() {
    let t = test_engine();
    let ds = new_dataset(&t).await;

    let result = t
        .engine
        .masks
        .delete_masks(ds, &[MaskPair::new(4, 4)])
        .await
        .unwrap();
    assert!(!result.deleted_anything());
    assert!(stored_index(&t, ds).await.is_none());
}

#[tokio::test]
async fn corrupt_index_degrades_reads_but_fails_partial_update() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let masks = &t.engine.masks;

    masks.upload_mask(ds, 1, 0, solid_png(2, 2)).await.unwrap();
    t.blobs
        .put(&rle_index_key(ds), b"{not json".to_vec())
        .await
        .unwrap();

    assert!(masks.get_mask_json(ds).await.is_empty());
    assert_eq!(masks.get_rle_mask(ds, 1, 0).await, None);

    assert_matches!(
        masks.update_rle_masks(ds, Some(&[MaskPair::new(1, 0)][..])).await,
        Err(CoreError::StorageIo(_))
    );

    let rebuilt = masks.update_rle_masks(ds, None).await.unwrap();
    assert_eq!(rebuilt.index.pairs(), vec![MaskPair::new(1, 0)]);
    assert!(masks.get_rle_mask(ds, 1, 0).await.is_some());
}

#[tokio::test]
async fn missing_image_is_skipped() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let masks = &t.engine.masks;

    let item = masks.upload_mask(ds, 1, 0, solid_png(2, 2)).await.unwrap();
    masks.upload_mask(ds, 1, 1, solid_png(2, 2)).await.unwrap();
    t.blobs.delete(item.blob_key.as_deref().unwrap()).await.unwrap();

    let rebuilt = masks.update_rle_masks(ds, None).await.unwrap();
    assert_eq!(rebuilt.skipped, vec![MaskPair::new(1, 0)]);
    assert_eq!(rebuilt.index.pairs(), vec![MaskPair::new(1, 1)]);
}

#[tokio::test]
async fn whole_track_reconcile_rebuilds_only_that_track() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let masks = &t.engine.masks;

    masks.upload_mask(ds, 1, 0, solid_png(2, 2)).await.unwrap();
    masks.upload_mask(ds, 2, 0, solid_png(2, 2)).await.unwrap();
    t.store.delete_mask_frame(ds, 1, 0).await.unwrap();

    masks
        .update_rle_masks(ds, Some(&[MaskPair::whole_track(1)][..]))
        .await
        .unwrap();
    assert_eq!(
        masks.get_mask_json(ds).await.pairs(),
        vec![MaskPair::new(2, 0)]
    );
}

#[tokio::test]
async fn undecodable_upload_rejected() {
    let t = test_engine();
    let ds = new_dataset(&t).await;

    let err = t
        .engine
        .masks
        .upload_mask(ds, 1, 0, b"not an image".to_vec())
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::Validation(_));
    assert!(t.store.list_mask_items(ds, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_track_removes_its_masks() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let e = &t.engine;

    let batch = AnnotationBatch {
        tracks: KindBatch::upsert(vec![track(1, &[0, 1]), track(2, &[0])]),
        groups: KindBatch::default(),
    };
    e.versioning.save(ds, &batch, &SaveOptions::default()).await.unwrap();
    e.masks.upload_mask(ds, 1, 0, solid_png(2, 2)).await.unwrap();
    e.masks.upload_mask(ds, 1, 1, solid_png(2, 2)).await.unwrap();
    e.masks.upload_mask(ds, 2, 0, solid_png(2, 2)).await.unwrap();

    let batch = AnnotationBatch {
        tracks: KindBatch::delete(vec![1]),
        groups: KindBatch::default(),
    };
    e.versioning.save(ds, &batch, &SaveOptions::default()).await.unwrap();

    assert!(t.store.list_mask_items(ds, Some(1)).await.unwrap().is_empty());
    assert_eq!(
        e.masks.get_mask_json(ds).await.pairs(),
        vec![MaskPair::new(2, 0)]
    );
}

#[tokio::test]
async fn local_blob_store_backs_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
    let engine = Engine::new(
        MemoryStore::new(),
        blobs,
        &EngineConfig::embedded(dir.path()),
    );
    let ds = engine
        .datasets
        .create_dataset("on disk", None)
        .await
        .unwrap()
        .id;

    engine.masks.upload_mask(ds, 3, 4, solid_png(4, 4)).await.unwrap();

    let on_disk = std::fs::read(dir.path().join(rle_index_key(ds))).unwrap();
    let index = RleIndex::from_json_slice(&on_disk).unwrap();
    assert_eq!(index.get(3, 4).unwrap().rle.counts, "0`0");
}
