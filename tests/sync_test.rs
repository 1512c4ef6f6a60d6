mod common;

use common::{block, fast_controller, file_url, image_block, record, ts, Harness, DB_ID};
use notion_sync::db;
use notion_sync::engine::EngineSettings;
use notion_sync::error::SyncError;
use notion_sync::fetch::FetchOptions;
use notion_sync::store::RunStateStore;
use notion_sync::sync::RunOptions;
use serde_json::{json, Value};
use std::time::Duration;

const FULL: RunOptions = RunOptions {
    incremental: false,
    check_deletions: true,
};

async fn record_count(h: &Harness) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM records")
        .fetch_one(h.pool())
        .await
        .unwrap()
}

async fn body_of(h: &Harness, remote_id: &str) -> String {
    let id = db::find_record_id(h.pool(), remote_id)
        .await
        .unwrap()
        .expect("record exists");
    db::fetch_record(h.pool(), id).await.unwrap().unwrap().body
}

fn with_cover(mut record: Value, url: &str) -> Value {
    record["cover"] = json!({ "type": "file", "file": { "url": url } });
    record
}

#[tokio::test]
async fn full_sync_imports_records_and_queues_media() {
    let h = Harness::new().await;
    let pic = file_url("/files/pic.png", "s2");
    h.fake.set_records(vec![
        with_cover(
            record("r1", "2024-03-01T10:00:00.000Z", "First"),
            &file_url("/files/cover.png", "s1"),
        ),
        record("r2", "2024-03-02T10:00:00.000Z", "Second"),
    ]);
    h.fake.set_children(
        "r1",
        vec![
            block("p1", "heading_1", "Title", false),
            image_block("img1", &pic),
            image_block("img2", &pic),
        ],
    );
    h.fake
        .set_children("r2", vec![block("p2", "paragraph", "Plain body", false)]);

    let stats = h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.failed, 0);
    assert!(stats.is_consistent());
    assert_eq!(stats.watermark, Some(ts("2024-03-02T10:00:00Z")));
    assert!(stats.started_at.is_some() && stats.finished_at.is_some());

    let body = body_of(&h, "r1").await;
    assert!(body.starts_with("# Title"), "{}", body);
    assert!(body.contains(&format!("![]({})", pic)), "{}", body);
    assert_eq!(body_of(&h, "r2").await, "Plain body");

    // Cover plus one task for the image referenced twice.
    let counts = h.engine.queue.counts().await.unwrap();
    assert_eq!(counts.pending, 2);

    let runs = db::recent_runs(h.pool(), DB_ID, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].total, 2);
}

#[tokio::test]
async fn second_full_sync_updates_in_place() {
    let h = Harness::new().await;
    h.fake
        .set_records(vec![record("r1", "2024-03-01T10:00:00.000Z", "First")]);
    h.engine.coordinator.run(DB_ID, FULL).await.unwrap();

    h.fake
        .set_records(vec![record("r1", "2024-03-05T10:00:00.000Z", "Renamed")]);
    let stats = h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.created, 0);
    assert_eq!(record_count(&h).await, 1);

    let id = db::find_record_id(h.pool(), "r1").await.unwrap().unwrap();
    let row = db::fetch_record(h.pool(), id).await.unwrap().unwrap();
    assert_eq!(row.title.as_deref(), Some("Renamed"));
    assert_eq!(row.last_synced_time, Some(ts("2024-03-05T10:00:00Z")));
}

#[tokio::test]
async fn held_lock_skips_the_run_without_remote_calls() {
    let h = Harness::new().await;
    h.fake
        .set_records(vec![record("r1", "2024-03-01T10:00:00.000Z", "First")]);

    let lock = h
        .engine
        .store
        .try_acquire_lock(DB_ID, Duration::from_secs(60))
        .await
        .unwrap()
        .expect("lock is free");

    let err = h
        .engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_already_running());
    assert!(h.fake.calls().is_empty());
    assert_eq!(record_count(&h).await, 0);

    h.engine.store.release_lock(&lock).await.unwrap();
    let stats = h
        .engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.created, 1);
}

#[tokio::test]
async fn concurrent_runs_are_mutually_exclusive() {
    let h = Harness::new().await;
    h.fake.set_latency(Duration::from_millis(50));
    h.fake.set_records(vec![
        record("r1", "2024-03-01T10:00:00.000Z", "First"),
        record("r2", "2024-03-01T11:00:00.000Z", "Second"),
    ]);

    let coordinator = h.engine.coordinator.clone();
    let (a, b) = tokio::join!(
        coordinator.run(DB_ID, FULL),
        coordinator.run(DB_ID, FULL)
    );
    let outcomes = [a, b];
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, Err(SyncError::AlreadyRunning { .. })))
        .count();
    assert_eq!(skipped, 1);
    let stats = outcomes
        .iter()
        .find_map(|o| o.as_ref().ok())
        .expect("one run completed");
    assert_eq!(stats.created, 2);
    assert_eq!(record_count(&h).await, 2);
}

#[tokio::test]
async fn lock_is_released_after_a_failed_listing() {
    let h = Harness::new().await;
    h.fake
        .set_records(vec![record("r1", "2024-03-01T10:00:00.000Z", "First")]);
    h.fake.fail_always(DB_ID, 400);

    let err = h.engine.coordinator.run(DB_ID, FULL).await.unwrap_err();
    assert!(matches!(err, SyncError::Listing { .. }), "{:?}", err);

    h.fake.clear_failures();
    let stats = h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(stats.created, 1);
}

#[tokio::test]
async fn expired_lock_is_taken_over() {
    let h = Harness::new().await;
    h.fake
        .set_records(vec![record("r1", "2024-03-01T10:00:00.000Z", "First")]);

    // Left behind by a crashed run with a zero ttl.
    h.engine
        .store
        .try_acquire_lock(DB_ID, Duration::ZERO)
        .await
        .unwrap()
        .expect("lock is free");

    let stats = h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(stats.created, 1);
}

#[tokio::test]
async fn incremental_skips_records_that_did_not_move_forward() {
    let h = Harness::new().await;
    let t0 = "2024-03-01T12:00:00.000Z";
    h.fake.set_records(vec![
        record("older", t0, "Older"),
        record("same", t0, "Same"),
        record("newer", t0, "Newer"),
    ]);
    let first = h
        .engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.created, 3);

    h.fake.set_records(vec![
        record("older", "2024-03-01T11:59:59.000Z", "Older"),
        record("same", t0, "Same"),
        record("newer", "2024-03-01T12:00:01.000Z", "Newer v2"),
    ]);
    // Forget the run watermark so the listing is unfiltered and the
    // per-record comparison decides.
    sqlx::query("DELETE FROM sync_runs")
        .execute(h.pool())
        .await
        .unwrap();

    let stats = h
        .engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.updated, 1);
    assert!(stats.is_consistent());
    assert_eq!(stats.watermark, Some(ts("2024-03-01T12:00:01Z")));

    let id = db::find_record_id(h.pool(), "newer").await.unwrap().unwrap();
    let row = db::fetch_record(h.pool(), id).await.unwrap().unwrap();
    assert_eq!(row.title.as_deref(), Some("Newer v2"));
}

#[tokio::test]
async fn incremental_listing_is_filtered_by_the_last_clean_run() {
    let h = Harness::new().await;
    h.fake.set_records(vec![
        record("a", "2024-03-01T10:00:00.000Z", "A"),
        record("b", "2024-03-01T11:00:00.000Z", "B"),
    ]);
    h.engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap();

    h.fake.reset_calls();
    let stats = h
        .engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.total, 0);
    // The previous watermark carries over an empty listing.
    assert_eq!(stats.watermark, Some(ts("2024-03-01T11:00:00Z")));

    let query = &h.fake.calls()[0];
    let body = query.body.as_ref().unwrap();
    assert_eq!(
        body["filter"]["last_edited_time"]["after"],
        "2024-03-01T11:00:00.000Z"
    );
    // Filtered listings never delete.
    assert_eq!(stats.deleted, 0);
    assert_eq!(record_count(&h).await, 2);

    // A full run ignores the watermark and re-imports everything.
    let full = h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(full.updated, 2);
}

#[tokio::test]
async fn records_missing_remotely_are_deleted() {
    let h = Harness::new().await;
    let records: Vec<Value> = (0..5)
        .map(|i| record(&format!("r{}", i), "2024-03-01T10:00:00.000Z", "R"))
        .collect();
    h.fake.set_records(records.clone());
    h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(record_count(&h).await, 5);

    h.fake.set_records(records[..3].to_vec());
    let stats = h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.total, 3);
    assert_eq!(record_count(&h).await, 3);
    assert!(db::find_record_id(h.pool(), "r4").await.unwrap().is_none());

    let no_check = RunOptions {
        incremental: false,
        check_deletions: false,
    };
    h.fake.set_records(records[..1].to_vec());
    let stats = h.engine.coordinator.run(DB_ID, no_check).await.unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(record_count(&h).await, 3);
}

#[tokio::test]
async fn one_failing_record_does_not_stop_the_run() {
    let h = Harness::new().await;
    h.fake.set_records(vec![
        record("a", "2024-03-01T10:00:00.000Z", "A"),
        record("b", "2024-03-01T11:00:00.000Z", "B"),
        record("c", "2024-03-01T12:00:00.000Z", "C"),
    ]);
    h.fake.set_children("b", vec![block("bt", "toggle", "T", true)]);
    h.fake.fail_always("bt", 500);

    let stats = h
        .engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.errors.len(), 1);
    assert!(stats.errors[0].starts_with("b:"), "{}", stats.errors[0]);
    assert!(stats.is_consistent());
    assert!(db::find_record_id(h.pool(), "b").await.unwrap().is_none());

    // A run with failures leaves no watermark behind, so the next run lists
    // everything again and picks up the failed record.
    h.fake.clear_failures();
    h.fake.reset_calls();
    let retry = h
        .engine
        .coordinator
        .run(DB_ID, RunOptions::default())
        .await
        .unwrap();
    let query = &h.fake.calls()[0];
    assert!(query.body.as_ref().unwrap().get("filter").is_none());
    assert_eq!(retry.created, 1);
    assert_eq!(retry.skipped, 2);
}

#[tokio::test]
async fn database_urls_are_normalised() {
    let h = Harness::new().await;
    h.fake
        .set_records(vec![record("r1", "2024-03-01T10:00:00.000Z", "First")]);
    let url = format!(
        "https://www.notion.so/team/{}?v=abc",
        DB_ID.replace('-', "")
    );
    let stats = h.engine.coordinator.run(&url, FULL).await.unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(
        h.fake.calls()[0].path,
        format!("/v1/databases/{}/query", DB_ID)
    );
}

#[tokio::test]
async fn truncated_listing_deletes_nothing() {
    let h = Harness::with_settings(EngineSettings {
        controller: fast_controller(),
        cache_ttl: Duration::from_secs(60),
        fetch: FetchOptions {
            page_size: 2,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let records: Vec<Value> = (0..5)
        .map(|i| record(&format!("r{}", i), "2024-03-01T10:00:00.000Z", "R"))
        .collect();
    h.fake.set_records(records);
    h.engine.coordinator.run(DB_ID, FULL).await.unwrap();
    assert_eq!(record_count(&h).await, 5);

    h.fake.drop_next_cursors();
    let err = h.engine.coordinator.run(DB_ID, FULL).await.unwrap_err();
    assert!(matches!(err, SyncError::Listing { .. }), "{:?}", err);
    assert_eq!(record_count(&h).await, 5);
}
