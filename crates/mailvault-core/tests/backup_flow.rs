use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use mailvault_core::gmail::{CONTROL_HANDLE, MockMailbox};
use mailvault_core::message::{MessageMeta, gunzip};
use mailvault_core::state::ClaimKind;
use mailvault_core::storage::{GZIP_CONTENT_TYPE, STATE_KEY, content_key, get_json_opt, meta_key};
use mailvault_core::{
    BackupEngine, BackupMode, BackupOptions, FsObjectStore, MemoryObjectStore, ObjectStore,
    RetryPolicy, StateStore,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const JAN_2_2024_MS: i64 = 1_704_153_600_000;
const DEC_30_2023_MS: i64 = 1_703_894_400_000;

fn raw(id: &str) -> Vec<u8> {
    format!("Message-ID: <{id}@example.com>\r\nSubject: note {id}\r\n\r\nbody of {id}\r\n")
        .into_bytes()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::ZERO, Duration::ZERO)
}

async fn open_state(dir: &TempDir, name: &str) -> Arc<StateStore> {
    Arc::new(
        StateStore::open(&dir.path().join(name))
            .await
            .expect("open state"),
    )
}

fn engine(
    state: Arc<StateStore>,
    store: Arc<dyn ObjectStore>,
    mailbox: &MockMailbox,
    options: BackupOptions,
) -> BackupEngine<MockMailbox> {
    BackupEngine::new(
        state,
        store,
        Arc::new(mailbox.clone()),
        fast_retry(),
        options,
    )
}

fn seeded_mailbox(ids: &[&str]) -> MockMailbox {
    let mailbox = MockMailbox::with_email("Owner@example.com");
    for id in ids {
        mailbox.add_message(id, &raw(id), &["INBOX"], JAN_2_2024_MS);
    }
    mailbox
}

#[tokio::test]
async fn full_scan_then_incremental_picks_up_new_mail() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["m1", "m2", "m3"]);

    let first = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("first run");

    assert_eq!(first.mode, BackupMode::FullScan);
    assert_eq!(first.uploaded, 3);
    assert_eq!(first.errors, 0);
    assert!(!first.capped);

    let body = store.get(&content_key("m2")).await.expect("content");
    assert_eq!(gunzip(&body).expect("gunzip"), raw("m2"));
    assert_eq!(
        store.content_type(&content_key("m2")).as_deref(),
        Some(GZIP_CONTENT_TYPE)
    );
    let meta: MessageMeta = get_json_opt(&store, &meta_key("m2"))
        .await
        .expect("read meta")
        .expect("meta stored");
    assert_eq!(meta.labels(), ["INBOX".to_string()]);

    let doc = state.read_state().await.expect("state");
    assert!(doc.full_scan_complete);
    assert_eq!(doc.history_id, Some(mailbox.history_id().to_string()));
    assert_eq!(doc.email_address.as_deref(), Some("Owner@example.com"));
    assert!(doc.last_run_at.is_some());

    let mirror: Value = get_json_opt(&store, STATE_KEY)
        .await
        .expect("read mirror")
        .expect("mirror written");
    assert_eq!(mirror["fullScanComplete"], true);

    mailbox.add_message("m4", &raw("m4"), &["INBOX"], JAN_2_2024_MS);
    let second = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("second run");

    assert_eq!(second.mode, BackupMode::Incremental);
    assert_eq!(second.uploaded, 1);
    assert!(state.was_transferred("m4").await.expect("lookup"));
    assert_eq!(
        state.read_state().await.expect("state").history_id,
        Some(mailbox.history_id().to_string())
    );

    let third = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("third run");
    assert_eq!(third.mode, BackupMode::Incremental);
    assert_eq!(third.uploaded, 0);
    assert_eq!(mailbox.fetch_calls(), 4);
}

#[tokio::test]
async fn capped_scan_is_resumed_by_another_full_scan() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["m1", "m2", "m3", "m4", "m5"]);

    let capped = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions {
            max_messages: Some(2),
            workers: 1,
            ..BackupOptions::default()
        },
    )
    .run(&CancellationToken::new())
    .await
    .expect("capped run");

    assert!(capped.capped);
    assert_eq!(capped.uploaded, 2);
    let doc = state.read_state().await.expect("state");
    assert!(!doc.full_scan_complete);
    assert_eq!(doc.history_id, None);

    let resumed = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("resumed run");

    assert_eq!(resumed.mode, BackupMode::FullScan);
    assert_eq!(resumed.uploaded, 3);
    assert_eq!(resumed.skipped, 2);
    assert!(state.read_state().await.expect("state").full_scan_complete);
    assert_eq!(state.transferred_count().await.expect("count"), 5);
}

#[tokio::test]
async fn expired_cursor_falls_back_to_full_scan() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["m1", "m2"]);

    engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("first run");

    mailbox.add_message("m3", &raw("m3"), &["INBOX"], JAN_2_2024_MS);
    mailbox.expire_history();

    let stats = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("fallback run");

    assert_eq!(stats.mode, BackupMode::FullScan);
    assert_eq!(stats.uploaded, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(
        state.read_state().await.expect("state").history_id,
        Some(mailbox.history_id().to_string())
    );
}

#[tokio::test]
async fn item_failures_are_counted_and_transient_ones_retried() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["m1", "m2", "m3"]);
    mailbox.fail_fetch("m2", 404);
    mailbox.fail_fetch_times("m3", 503, 2);

    let stats = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("run completes");

    assert!(stats.has_errors());
    assert_eq!(stats.uploaded, 2);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.error_samples, vec!["m2: HttpError(status=404)".to_string()]);
    assert!(state.was_transferred("m3").await.expect("lookup"));
    assert!(!state.was_transferred("m2").await.expect("lookup"));
    assert_eq!(state.in_flight_count(ClaimKind::Upload).await.expect("count"), 0);
}

#[tokio::test]
async fn parallel_workers_transfer_each_message_once() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["a", "b", "c"]);

    let stats = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions {
            workers: 2,
            ..BackupOptions::default()
        },
    )
    .run(&CancellationToken::new())
    .await
    .expect("run");

    assert_eq!(stats.uploaded + stats.skipped, 3);
    assert_eq!(stats.uploaded, 3);
    assert_eq!(mailbox.fetch_calls(), 3);

    let opened = mailbox.opened_workers();
    assert!(opened.contains(&CONTROL_HANDLE));
    let workers: Vec<usize> = opened
        .into_iter()
        .filter(|index| *index != CONTROL_HANDLE)
        .collect();
    assert!(!workers.is_empty() && workers.len() <= 2, "opened {workers:?}");
}

#[tokio::test]
async fn parallel_workers_share_one_change_log_page() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["seed"]);

    engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("full scan");
    assert_eq!(mailbox.fetch_calls(), 1);

    for id in ["a", "b", "c"] {
        mailbox.add_message(id, &raw(id), &["INBOX"], JAN_2_2024_MS);
    }
    let stats = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions {
            workers: 2,
            ..BackupOptions::default()
        },
    )
    .run(&CancellationToken::new())
    .await
    .expect("incremental run");

    assert_eq!(stats.mode, BackupMode::Incremental);
    assert_eq!(stats.uploaded + stats.skipped + stats.errors, 3);
    assert_eq!(stats.uploaded, 3);
    assert_eq!(mailbox.fetch_calls(), 4);
    assert_eq!(state.in_flight_count(ClaimKind::Upload).await.expect("count"), 0);
    for id in ["a", "b", "c"] {
        assert!(state.was_transferred(id).await.expect("lookup"), "{id} transferred");
    }
    assert_eq!(
        state.read_state().await.expect("state").history_id,
        Some(mailbox.history_id().to_string())
    );
}

#[tokio::test]
async fn new_machine_bootstraps_from_the_mirror() {
    let dir = TempDir::new().expect("temp dir");
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["m1", "m2"]);

    engine(
        open_state(&dir, "laptop").await,
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("first machine");

    mailbox.add_message("m3", &raw("m3"), &["INBOX"], JAN_2_2024_MS);
    let fresh = open_state(&dir, "server").await;
    let stats = engine(
        fresh.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&CancellationToken::new())
    .await
    .expect("second machine");

    assert_eq!(stats.mode, BackupMode::Incremental);
    assert_eq!(stats.uploaded, 1);
    let doc = fresh.read_state().await.expect("state");
    assert!(doc.full_scan_complete);
    assert_eq!(doc.email_address.as_deref(), Some("Owner@example.com"));
}

#[tokio::test]
async fn since_limits_the_full_scan() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = MockMailbox::new();
    mailbox.add_message("old", &raw("old"), &["INBOX"], DEC_30_2023_MS);
    mailbox.add_message("new", &raw("new"), &["INBOX"], JAN_2_2024_MS);

    let stats = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions {
            since: NaiveDate::from_ymd_opt(2024, 1, 1),
            ..BackupOptions::default()
        },
    )
    .run(&CancellationToken::new())
    .await
    .expect("run");

    assert_eq!(stats.uploaded, 1);
    assert!(state.was_transferred("new").await.expect("lookup"));
    assert!(!state.was_transferred("old").await.expect("lookup"));
}

#[tokio::test]
async fn cancelled_run_leaves_scan_incomplete() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let store = MemoryObjectStore::new();
    let mailbox = seeded_mailbox(&["m1", "m2"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let stats = engine(
        state.clone(),
        Arc::new(store.clone()),
        &mailbox,
        BackupOptions::default(),
    )
    .run(&cancel)
    .await
    .expect("interrupted run");

    assert!(stats.interrupted);
    assert_eq!(stats.uploaded, 0);
    let doc = state.read_state().await.expect("state");
    assert!(!doc.full_scan_complete);
    assert_eq!(doc.history_id, None);
}

#[tokio::test]
async fn directory_store_lays_out_objects_under_the_prefix() {
    let dir = TempDir::new().expect("temp dir");
    let state = open_state(&dir, "state").await;
    let bucket = dir.path().join("bucket");
    let store = FsObjectStore::new(&bucket, "gmail-backup/owner-at-example.com").expect("store");
    let mailbox = seeded_mailbox(&["m1"]);

    let stats = engine(state, Arc::new(store), &mailbox, BackupOptions::default())
        .run(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(stats.uploaded, 1);
    let base = bucket.join("gmail-backup/owner-at-example.com");
    assert!(base.join("messages/m1.eml.gz").is_file());
    assert!(base.join("messages/m1.json").is_file());
    assert!(base.join("state/state.json").is_file());
}
