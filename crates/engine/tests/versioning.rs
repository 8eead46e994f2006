//! Revisioned save, history reconstruction and rollback against the memory
//! backend.

mod common;

use assert_matches::assert_matches;
use common::{new_dataset, rejecting_engine, test_engine, track};
use dive_core::annotation::{ConfidencePair, Group, GroupMember, Track};
use dive_core::batch::{AnnotationBatch, KindBatch, SaveOptions};
use dive_core::error::CoreError;
use dive_core::revision::RecordFilter;
use dive_engine::store::RecordStore;
use dive_engine::versioning::ListParams;
use serde_json::json;

fn upsert(tracks: Vec<Track>) -> AnnotationBatch {
    AnnotationBatch {
        tracks: KindBatch::upsert(tracks),
        groups: KindBatch::default(),
    }
}

fn delete(ids: Vec<i64>) -> AnnotationBatch {
    AnnotationBatch {
        tracks: KindBatch::delete(ids),
        groups: KindBatch::default(),
    }
}

fn ids(tracks: &[Track]) -> Vec<i64> {
    tracks.iter().map(|t| t.id).collect()
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_delete_rollback_scenario() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let saved = v
        .save(ds, &upsert(vec![track(1, &[0, 1, 2])]), &SaveOptions::default())
        .await
        .unwrap();
    assert_eq!((saved.updated, saved.deleted), (1, 0));
    assert_eq!(v.head(ds).await.unwrap(), 1);

    let saved = v.save(ds, &delete(vec![1]), &SaveOptions::default()).await.unwrap();
    assert_eq!((saved.updated, saved.deleted), (0, 1));
    assert_eq!(v.head(ds).await.unwrap(), 2);

    let at1: Vec<Track> = v.list(ds, &ListParams::at(1)).await.unwrap();
    assert_eq!(ids(&at1), vec![1]);
    let at2: Vec<Track> = v.list(ds, &ListParams::at(2)).await.unwrap();
    assert!(at2.is_empty());

    v.rollback(ds, 1).await.unwrap();
    let now: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(ids(&now), vec![1]);
    assert_eq!(v.head(ds).await.unwrap(), 1);
}

#[tokio::test]
async fn no_op_save_does_not_advance_head() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let saved = v.save(ds, &delete(vec![42]), &SaveOptions::default()).await.unwrap();
    assert_eq!((saved.updated, saved.deleted, saved.revision), (0, 0, None));
    assert_eq!(v.head(ds).await.unwrap(), 0);

    let saved = v
        .save(ds, &AnnotationBatch::default(), &SaveOptions::default())
        .await
        .unwrap();
    assert_eq!(saved.revision, None);
    assert_eq!(v.history(ds, None, 0).await.unwrap().total, 0);
}

#[tokio::test]
async fn each_changing_save_advances_head_by_one() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    for (expected, frames) in [(1, vec![0]), (2, vec![0, 4]), (3, vec![2, 3])] {
        let saved = v
            .save(ds, &upsert(vec![track(7, &frames)]), &SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(saved.revision, Some(expected));
        assert_eq!(v.head(ds).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn upsert_replaces_prior_live_record() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    v.save(ds, &upsert(vec![track(1, &[0])]), &SaveOptions::default())
        .await
        .unwrap();
    let saved = v
        .save(ds, &upsert(vec![track(1, &[0, 5])]), &SaveOptions::default())
        .await
        .unwrap();
    assert_eq!((saved.updated, saved.deleted), (1, 1));

    // Exactly one live record per id at every revision.
    for r in 0..=2 {
        let live = t
            .store
            .count::<Track>(&RecordFilter::live_at(ds, r))
            .await
            .unwrap();
        assert_eq!(live, if r == 0 { 0 } else { 1 }, "revision {r}");
    }
    let current: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(current[0].end, 5);
    let old: Vec<Track> = v.list(ds, &ListParams::at(1)).await.unwrap();
    assert_eq!(old[0].end, 0);
}

#[tokio::test]
async fn overwrite_retires_everything_live() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    v.save(
        ds,
        &upsert(vec![track(1, &[0]), track(2, &[0]), track(3, &[0])]),
        &SaveOptions::default(),
    )
    .await
    .unwrap();

    let options = SaveOptions {
        overwrite: true,
        ..SaveOptions::default()
    };
    let saved = v.save(ds, &upsert(vec![track(9, &[1])]), &options).await.unwrap();
    assert_eq!((saved.updated, saved.deleted), (1, 3));

    let current: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(ids(&current), vec![9]);
}

#[tokio::test]
async fn prevent_revision_writes_without_logging() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let options = SaveOptions {
        prevent_revision: true,
        ..SaveOptions::default()
    };
    let saved = v.save(ds, &upsert(vec![track(1, &[0])]), &options).await.unwrap();
    assert_eq!(saved.updated, 1);
    assert_eq!(saved.revision, None);
    assert_eq!(v.head(ds).await.unwrap(), 0);
    assert_eq!(
        t.store.count::<Track>(&RecordFilter::dataset(ds)).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn save_after_unlogged_save_keeps_the_track() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let unlogged = SaveOptions {
        prevent_revision: true,
        ..SaveOptions::default()
    };
    v.save(ds, &upsert(vec![track(1, &[0])]), &unlogged).await.unwrap();

    let saved = v
        .save(ds, &upsert(vec![track(1, &[0, 4])]), &SaveOptions::default())
        .await
        .unwrap();
    assert_eq!((saved.updated, saved.deleted), (1, 1));
    assert_eq!(saved.revision, Some(2));
    assert_eq!(v.head(ds).await.unwrap(), 2);

    let live: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(ids(&live), vec![1]);
    assert_eq!(live[0].end, 4);
}

#[tokio::test]
async fn partial_failure_logs_what_landed_then_errors() {
    let (engine, store) = rejecting_engine(2);
    let ds = engine.datasets.create_dataset("partial", None).await.unwrap().id;
    let v = &engine.versioning;

    v.save(ds, &upsert(vec![track(1, &[0])]), &SaveOptions::default())
        .await
        .unwrap();

    let err = v
        .save(
            ds,
            &upsert(vec![track(1, &[0, 3]), track(2, &[1])]),
            &SaveOptions::default(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::Conflict(_));
    assert!(err.is_retryable());

    // Revision 2 records the retire of track 1 and its one replacement.
    assert_eq!(v.head(ds).await.unwrap(), 2);
    let history = v.history(ds, None, 0).await.unwrap();
    let latest = &history.entries[0];
    assert_eq!(latest.revision, 2);
    assert_eq!((latest.additions, latest.deletions), (1, 1));

    let live: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(ids(&live), vec![1]);
    assert_eq!(live[0].end, 3);
    assert_eq!(
        store
            .count::<Track>(&RecordFilter::dataset(ds))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn invalid_track_rejected_before_any_write() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let mut bad = track(2, &[0, 1]);
    bad.begin = 1;
    let err = v
        .save(ds, &upsert(vec![track(1, &[0]), bad]), &SaveOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::Validation(_));
    assert_eq!(v.head(ds).await.unwrap(), 0);
    assert_eq!(
        t.store.count::<Track>(&RecordFilter::dataset(ds)).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn unknown_dataset_is_not_found() {
    let t = test_engine();
    let err = t
        .engine
        .versioning
        .save(999, &upsert(vec![track(1, &[0])]), &SaveOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::NotFound { entity: "Dataset", id: 999 });
}

#[tokio::test]
async fn groups_are_versioned_independently() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let group = Group {
        id: 1,
        begin: 0,
        end: 3,
        confidence_pairs: vec![ConfidencePair::new("school", 1.0)],
        attributes: Default::default(),
        members: [("1".to_string(), GroupMember { ranges: vec![[0, 3]] })].into(),
    };
    let batch = AnnotationBatch {
        tracks: KindBatch::upsert(vec![track(1, &[0, 3])]),
        groups: KindBatch::upsert(vec![group]),
    };
    let saved = v.save(ds, &batch, &SaveOptions::default()).await.unwrap();
    assert_eq!(saved.updated, 2);

    let batch = AnnotationBatch {
        tracks: KindBatch::default(),
        groups: KindBatch::delete(vec![1]),
    };
    v.save(ds, &batch, &SaveOptions::default()).await.unwrap();

    let groups: Vec<Group> = v.list(ds, &ListParams::default()).await.unwrap();
    assert!(groups.is_empty());
    let tracks: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(ids(&tracks), vec![1]);
}

#[tokio::test]
async fn concurrent_saves_get_contiguous_revisions() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let a = upsert(vec![track(1, &[0])]);
    let b = upsert(vec![track(2, &[0])]);
    let opts = SaveOptions::default();
    let (ra, rb) = tokio::join!(v.save(ds, &a, &opts), v.save(ds, &b, &opts));

    let mut revisions = vec![ra.unwrap().revision, rb.unwrap().revision];
    revisions.sort();
    assert_eq!(revisions, vec![Some(1), Some(2)]);
}

// ---------------------------------------------------------------------------
// History and rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_reconstructs_every_revision() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;
    let opts = SaveOptions::default();

    v.save(ds, &upsert(vec![track(1, &[0]), track(2, &[0])]), &opts).await.unwrap();
    v.save(ds, &delete(vec![1]), &opts).await.unwrap();
    v.save(ds, &upsert(vec![track(3, &[0]), track(2, &[0, 9])]), &opts).await.unwrap();

    let expected: [(i64, Vec<i64>); 4] = [(0, vec![]), (1, vec![1, 2]), (2, vec![2]), (3, vec![2, 3])];
    for (revision, want) in expected {
        let live: Vec<Track> = v.list(ds, &ListParams::at(revision)).await.unwrap();
        assert_eq!(ids(&live), want, "revision {revision}");
    }
    let at2: Vec<Track> = v.list(ds, &ListParams::at(2)).await.unwrap();
    assert_eq!(at2[0].end, 0);
}

#[tokio::test]
async fn history_lists_newest_first_with_total() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    for i in 0..3 {
        v.save(
            ds,
            &upsert(vec![track(i, &[0])]),
            &SaveOptions::described(format!("save {i}")),
        )
        .await
        .unwrap();
    }

    let page = v.history(ds, Some(2), 0).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(
        page.entries.iter().map(|e| e.revision).collect::<Vec<_>>(),
        vec![3, 2]
    );
    assert_eq!(page.entries[0].description, "save 2");
    assert_eq!(page.entries[0].additions, 1);

    let rest = v.history(ds, Some(2), 2).await.unwrap();
    assert_eq!(rest.entries.len(), 1);
    assert_eq!(rest.entries[0].revision, 1);
}

#[tokio::test]
async fn rollback_is_idempotent() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;
    let opts = SaveOptions::default();

    v.save(ds, &upsert(vec![track(1, &[0]), track(2, &[0])]), &opts).await.unwrap();
    v.save(ds, &upsert(vec![track(1, &[0, 4])]), &opts).await.unwrap();
    v.save(ds, &delete(vec![2]), &opts).await.unwrap();

    let first = v.rollback(ds, 1).await.unwrap();
    assert_eq!(first.revisions_removed, 2);
    assert_eq!(first.records_purged, 1);
    assert_eq!(first.records_restored, 2);
    let after_first: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();

    let second = v.rollback(ds, 1).await.unwrap();
    assert_eq!(
        (second.revisions_removed, second.records_purged, second.records_restored),
        (0, 0, 0)
    );
    let after_second: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(after_first, after_second);
    assert_eq!(ids(&after_second), vec![1, 2]);
    assert_eq!(after_second[0].end, 0);
}

#[tokio::test]
async fn save_after_rollback_reuses_next_revision() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;
    let opts = SaveOptions::default();

    v.save(ds, &upsert(vec![track(1, &[0])]), &opts).await.unwrap();
    v.save(ds, &upsert(vec![track(1, &[0, 1])]), &opts).await.unwrap();
    v.rollback(ds, 1).await.unwrap();

    let saved = v.save(ds, &upsert(vec![track(1, &[0, 2])]), &opts).await.unwrap();
    assert_eq!(saved.revision, Some(2));
    let current: Vec<Track> = v.list(ds, &ListParams::default()).await.unwrap();
    assert_eq!(current[0].end, 2);
}

#[tokio::test]
async fn negative_revisions_rejected() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;
    assert_matches!(v.rollback(ds, -1).await, Err(CoreError::Validation(_)));
    assert_matches!(
        v.list::<Track>(ds, &ListParams::at(-3)).await,
        Err(CoreError::Validation(_))
    );
}

// ---------------------------------------------------------------------------
// Import / export
// ---------------------------------------------------------------------------

#[tokio::test]
async fn export_filters_by_confidence_threshold() {
    let t = test_engine();
    let ds = t
        .engine
        .datasets
        .create_dataset(
            "filtered",
            Some(json!({"confidenceFilters": {"default": 0.5, "crab": 0.9}})),
        )
        .await
        .unwrap()
        .id;
    let v = &t.engine.versioning;

    let tracks = vec![
        common::labeled_track(1, "fish", 0.7),
        common::labeled_track(2, "fish", 0.2),
        common::labeled_track(3, "crab", 0.8),
        track(4, &[0]),
    ];
    v.save(ds, &upsert(tracks), &SaveOptions::default()).await.unwrap();

    let all = v.export(ds, None, false).await.unwrap();
    assert_eq!(all.tracks.len(), 4);
    assert_eq!(all.version, 2);

    let filtered = v.export(ds, None, true).await.unwrap();
    let mut kept: Vec<&String> = filtered.tracks.keys().collect();
    kept.sort();
    assert_eq!(kept, vec!["1", "4"]);
}

#[tokio::test]
async fn import_legacy_document_then_export() {
    let t = test_engine();
    let ds = new_dataset(&t).await;
    let v = &t.engine.versioning;

    let legacy = json!({
        "5": {"id": 5, "begin": 0, "end": 1, "features": [
            {"frame": 0, "bounds": [0, 0, 2, 2]},
            {"frame": 1, "bounds": [1, 1, 3, 3]}
        ]}
    });
    let options = SaveOptions {
        overwrite: true,
        ..SaveOptions::described("import")
    };
    let saved = v.import_dive_json(ds, legacy, &options).await.unwrap();
    assert_eq!(saved.updated, 1);

    let exported = v.export(ds, None, false).await.unwrap();
    let doc = serde_json::to_value(&exported).unwrap();
    assert_eq!(doc["version"], 2);
    assert_eq!(doc["tracks"]["5"]["end"], 1);
    assert_eq!(doc["groups"], json!({}));
}
