//! Rebuilds the local index from what is already in object storage, for a new
//! machine or a lost state directory.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RunError;
use crate::restore::RestoreMarker;
use crate::state::{RestoreRecord, StateStore};
use crate::storage::{
    MESSAGES_PREFIX, ObjectStore, RESTORE_MARKER_PREFIX, StorageError, get_json_opt,
    id_from_content_key, id_from_marker_key,
};

const BATCH_SIZE: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct RehydrateOptions {
    /// Also replay `state/restore/*.json` into the restore index.
    pub with_markers: bool,
    /// Stop after this many listed objects. `None` or zero means no cap.
    pub max_objects: Option<u64>,
    pub progress_every: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehydrateReport {
    pub scanned: u64,
    pub transferred_before: u64,
    pub transferred_after: u64,
    /// Present only when markers were replayed.
    pub restored: Option<(u64, u64)>,
}

impl RehydrateReport {
    pub fn transferred_delta(&self) -> u64 {
        self.transferred_after.saturating_sub(self.transferred_before)
    }
}

pub async fn rehydrate_index(
    state: &StateStore,
    store: &dyn ObjectStore,
    options: &RehydrateOptions,
    cancel: &CancellationToken,
) -> Result<RehydrateReport, RunError> {
    let cap = options.max_objects.filter(|max| *max > 0);
    let transferred_before = state.transferred_count().await?;
    let now = Utc::now().timestamp();

    let mut scanned = 0u64;
    let mut batch: Vec<(String, i64)> = Vec::with_capacity(BATCH_SIZE);
    let mut token: Option<String> = None;
    'listing: loop {
        let page = store.list_page(MESSAGES_PREFIX, token.as_deref()).await?;
        for entry in page.objects {
            if cancel.is_cancelled() || cap.is_some_and(|cap| scanned >= cap) {
                break 'listing;
            }
            scanned += 1;
            if let Some(id) = id_from_content_key(&entry.key) {
                let at = entry.last_modified.map_or(now, |at| at.timestamp());
                batch.push((id.to_string(), at));
            }
            if batch.len() >= BATCH_SIZE {
                state.bulk_mark_transferred(&batch).await?;
                batch.clear();
            }
            if options.progress_every > 0 && scanned % options.progress_every == 0 {
                info!(scanned, "rehydrating message index");
            }
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    state.bulk_mark_transferred(&batch).await?;

    let transferred_after = state.transferred_count().await?;
    info!(
        scanned,
        before = transferred_before,
        after = transferred_after,
        "message index rehydrated"
    );

    let restored = if options.with_markers && !cancel.is_cancelled() {
        Some(replay_markers(state, store, options.progress_every).await?)
    } else {
        None
    };

    Ok(RehydrateReport {
        scanned,
        transferred_before,
        transferred_after,
        restored,
    })
}

async fn replay_markers(
    state: &StateStore,
    store: &dyn ObjectStore,
    progress_every: u64,
) -> Result<(u64, u64), RunError> {
    let before = state.restored_count().await?;
    let now = Utc::now().timestamp();

    let mut scanned = 0u64;
    let mut records: Vec<RestoreRecord> = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list_page(RESTORE_MARKER_PREFIX, token.as_deref()).await?;
        for entry in page.objects {
            scanned += 1;
            let Some(id) = id_from_marker_key(&entry.key) else {
                continue;
            };
            match get_json_opt::<_, RestoreMarker>(store, &entry.key).await {
                Ok(Some(marker)) if !marker.source_id.is_empty() => {
                    let at = entry.last_modified.map_or(now, |at| at.timestamp());
                    records.push(marker.to_record(at));
                }
                Ok(_) => {}
                // One unreadable marker should not block the rest.
                Err(err @ StorageError::Json { .. }) => {
                    debug!(marker = %id, error = %err, "skipping malformed restore marker");
                }
                Err(err) => return Err(err.into()),
            }
            if records.len() >= BATCH_SIZE {
                state.bulk_mark_restored(&records).await?;
                records.clear();
            }
            if progress_every > 0 && scanned % progress_every == 0 {
                info!(scanned, "replaying restore markers");
            }
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    state.bulk_mark_restored(&records).await?;

    let after = state.restored_count().await?;
    info!(scanned, before, after, "restore index rehydrated");
    Ok((before, after))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::restore::MarkerStatus;
    use crate::state::test_support::open_temp_state;
    use crate::storage::{
        GZIP_CONTENT_TYPE, JSON_CONTENT_TYPE, MemoryObjectStore, content_key, meta_key, put_json,
        restore_marker_key,
    };

    #[tokio::test]
    async fn indexes_content_objects_only() {
        let (state, _dir) = open_temp_state().await;
        let store = MemoryObjectStore::new();
        for id in ["a", "b", "c"] {
            store
                .put(&content_key(id), vec![0], GZIP_CONTENT_TYPE)
                .await
                .expect("put");
            store
                .put(&meta_key(id), b"{}".to_vec(), JSON_CONTENT_TYPE)
                .await
                .expect("put");
        }
        let backdated = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        store.set_last_modified(&content_key("a"), backdated);
        state.mark_transferred("c").await.expect("mark");

        let report = rehydrate_index(
            &state,
            &store,
            &RehydrateOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("rehydrate");

        assert_eq!(report.scanned, 6);
        assert_eq!(report.transferred_before, 1);
        assert_eq!(report.transferred_after, 3);
        assert_eq!(report.transferred_delta(), 2);
        assert_eq!(report.restored, None);
        assert!(state.was_transferred("a").await.expect("lookup"));
    }

    #[tokio::test]
    async fn cap_limits_listed_objects() {
        let (state, _dir) = open_temp_state().await;
        let store = MemoryObjectStore::new();
        for id in ["a", "b", "c", "d"] {
            store
                .put(&content_key(id), vec![0], GZIP_CONTENT_TYPE)
                .await
                .expect("put");
        }

        let options = RehydrateOptions {
            max_objects: Some(2),
            ..RehydrateOptions::default()
        };
        let report = rehydrate_index(&state, &store, &options, &CancellationToken::new())
            .await
            .expect("rehydrate");

        assert_eq!(report.scanned, 2);
        assert_eq!(report.transferred_after, 2);
        assert!(!state.was_transferred("d").await.expect("lookup"));
    }

    #[tokio::test]
    async fn replays_markers_and_skips_malformed_ones() {
        let (state, _dir) = open_temp_state().await;
        let store = MemoryObjectStore::new();
        let marker = RestoreMarker {
            source_id: "m1".into(),
            restored_id: Some("new-1".into()),
            message_id_header: None,
            raw_sha256: None,
            status: MarkerStatus::Inserted,
        };
        put_json(&store, &restore_marker_key("m1"), &marker)
            .await
            .expect("put marker");
        store
            .put(&restore_marker_key("m2"), b"not json".to_vec(), JSON_CONTENT_TYPE)
            .await
            .expect("put junk");

        let options = RehydrateOptions {
            with_markers: true,
            ..RehydrateOptions::default()
        };
        let report = rehydrate_index(&state, &store, &options, &CancellationToken::new())
            .await
            .expect("rehydrate");

        assert_eq!(report.restored, Some((0, 1)));
        let record = state
            .restore_record("m1")
            .await
            .expect("lookup")
            .expect("replayed");
        assert_eq!(record.restored_id.as_deref(), Some("new-1"));
        assert!(!state.was_restored("m2").await.expect("lookup"));
    }
}
