//! Object storage → mailbox.
//!
//! Inserting the same message twice is what a restore must never do, so a
//! candidate is skipped when any of these says it is already there: the local
//! restore index, a restore marker in storage, or a live `rfc822msgid:` search
//! for the message's own `Message-ID`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{ItemError, RunError};
use crate::gmail::{MailApi, MailboxFactory, Retrying};
use crate::message::{MessageMeta, SPAM_LABEL, TRASH_LABEL, fingerprint, gunzip, message_id_header};
use crate::retry::RetryPolicy;
use crate::state::{ClaimKind, RestoreRecord, StateStore};
use crate::storage::{
    MESSAGES_PREFIX, ObjectStore, content_key, get_json_opt, id_from_content_key, meta_key,
    put_json, restore_marker_key,
};
use crate::worker::{Budget, ItemHandler, ItemOutcome, Pipeline, RunTally};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    /// The engine inserted the message.
    Inserted,
    /// The message was already in the mailbox.
    Present,
}

/// `state/restore/<id>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreMarker {
    pub source_id: String,
    #[serde(default)]
    pub restored_id: Option<String>,
    #[serde(default)]
    pub message_id_header: Option<String>,
    #[serde(default)]
    pub raw_sha256: Option<String>,
    #[serde(default = "default_marker_status")]
    pub status: MarkerStatus,
}

fn default_marker_status() -> MarkerStatus {
    MarkerStatus::Inserted
}

impl RestoreMarker {
    pub fn to_record(&self, restored_at: i64) -> RestoreRecord {
        RestoreRecord {
            source_id: self.source_id.clone(),
            restored_id: self.restored_id.clone(),
            restored_at,
            message_id_header: self.message_id_header.clone(),
            raw_sha256: self.raw_sha256.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Without `apply` nothing is written anywhere; candidates that would be
    /// inserted are counted as restored.
    pub apply: bool,
    /// Skip candidates whose stored `internalDate` falls before this day.
    /// Candidates without a usable date are kept.
    pub since: Option<NaiveDate>,
    pub max_messages: Option<u64>,
    pub workers: usize,
    pub max_error_samples: usize,
    pub progress_every: u64,
    pub stale_claim_after: Duration,
    pub write_markers: bool,
}

impl RestoreOptions {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            apply: false,
            since: None,
            max_messages: None,
            workers: sync.workers,
            max_error_samples: sync.max_error_samples,
            progress_every: sync.progress_every,
            stale_claim_after: Duration::from_secs(sync.stale_claim_secs),
            write_markers: true,
        }
    }
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub apply: bool,
    pub considered: u64,
    pub restored: u64,
    pub skipped: u64,
    pub errors: u64,
    pub error_samples: Vec<String>,
    pub interrupted: bool,
}

impl RestoreStats {
    /// Per-item errors only fail a run that was allowed to write.
    pub fn should_fail(&self) -> bool {
        self.apply && self.errors > 0
    }
}

/// What `restore_one` decided for a single candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreDecision {
    pub restored_id: Option<String>,
    pub message_id_header: Option<String>,
    pub raw_sha256: Option<String>,
    pub did_restore: bool,
}

struct Restorer {
    state: Arc<StateStore>,
    store: Arc<dyn ObjectStore>,
    apply: bool,
    write_markers: bool,
}

impl Restorer {
    async fn restore_one<M: MailApi + ?Sized>(
        &self,
        mailbox: &M,
        id: &str,
    ) -> Result<RestoreDecision, ItemError> {
        if self.state.was_restored(id).await? {
            return Ok(RestoreDecision::default());
        }

        let marker_key = restore_marker_key(id);
        if let Some(marker) = get_json_opt::<_, RestoreMarker>(self.store.as_ref(), &marker_key).await? {
            if self.apply {
                let mut record = marker.to_record(Utc::now().timestamp());
                record.source_id = id.to_string();
                self.state.mark_restored(&record).await?;
            }
            debug!(message_id = %id, "restore marker found, skipping");
            return Ok(RestoreDecision::default());
        }

        let compressed = self.store.get(&content_key(id)).await?;
        let (raw, raw_sha256, header) = tokio::task::spawn_blocking(move || {
            let raw = gunzip(&compressed)?;
            let sha = fingerprint(&raw);
            let header = message_id_header(&raw);
            Ok::<_, std::io::Error>((raw, sha, header))
        })
        .await
        .map_err(|err| ItemError::Fatal(RunError::Worker(err.to_string())))??;

        if let Some(header) = header.as_deref() {
            if let Some(existing) = mailbox.find_by_message_id(header).await? {
                debug!(message_id = %id, existing = %existing, "already present in mailbox");
                if self.apply {
                    self.record(id, None, Some(header), &raw_sha256, MarkerStatus::Present)
                        .await?;
                }
                return Ok(RestoreDecision {
                    restored_id: None,
                    message_id_header: Some(header.to_string()),
                    raw_sha256: Some(raw_sha256),
                    did_restore: false,
                });
            }
        }

        if !self.apply {
            return Ok(RestoreDecision {
                restored_id: None,
                message_id_header: header,
                raw_sha256: Some(raw_sha256),
                did_restore: true,
            });
        }

        let meta: MessageMeta = get_json_opt(self.store.as_ref(), &meta_key(id))
            .await?
            .unwrap_or_default();
        let labels = meta.labels().to_vec();

        let (restored_id, labels_stripped) = match mailbox.insert_raw(&raw, &labels).await {
            Ok(new_id) => (new_id, false),
            Err(err) if !labels.is_empty() && matches!(err.status(), Some(400 | 403)) => {
                warn!(message_id = %id, status = ?err.status(), "insert with labels rejected, retrying without");
                (mailbox.insert_raw(&raw, &[]).await?, true)
            }
            Err(err) => return Err(err.into()),
        };
        info!(message_id = %id, restored_id = %restored_id, "restored message");

        reapply_labels(mailbox, &restored_id, &labels, labels_stripped).await;
        self.record(
            id,
            Some(&restored_id),
            header.as_deref(),
            &raw_sha256,
            MarkerStatus::Inserted,
        )
        .await?;

        Ok(RestoreDecision {
            restored_id: Some(restored_id),
            message_id_header: header,
            raw_sha256: Some(raw_sha256),
            did_restore: true,
        })
    }

    /// Local record first: it is the guard a rerun checks before anything
    /// else. The marker is best effort.
    async fn record(
        &self,
        id: &str,
        restored_id: Option<&str>,
        header: Option<&str>,
        raw_sha256: &str,
        status: MarkerStatus,
    ) -> Result<(), ItemError> {
        let marker = RestoreMarker {
            source_id: id.to_string(),
            restored_id: restored_id.map(str::to_string),
            message_id_header: header.map(str::to_string),
            raw_sha256: Some(raw_sha256.to_string()),
            status,
        };
        self.state
            .mark_restored(&marker.to_record(Utc::now().timestamp()))
            .await?;

        if self.write_markers {
            if let Err(err) = put_json(self.store.as_ref(), &restore_marker_key(id), &marker).await
            {
                warn!(message_id = %id, code = err.code(), "could not write restore marker");
            }
        }
        Ok(())
    }
}

/// Each step is independent; a failure is logged and the next one still runs.
async fn reapply_labels<M: MailApi + ?Sized>(
    mailbox: &M,
    restored_id: &str,
    labels: &[String],
    labels_stripped: bool,
) {
    let general: Vec<String> = labels
        .iter()
        .filter(|label| label.as_str() != TRASH_LABEL && label.as_str() != SPAM_LABEL)
        .cloned()
        .collect();
    if labels_stripped && !general.is_empty() {
        if let Err(err) = mailbox.modify_labels(restored_id, &general, &[]).await {
            warn!(restored_id, status = ?err.status(), "could not reapply labels");
        }
    }
    if labels.iter().any(|label| label == TRASH_LABEL) {
        if let Err(err) = mailbox.trash(restored_id).await {
            warn!(restored_id, status = ?err.status(), "could not move restored message to trash");
        }
    }
    if labels.iter().any(|label| label == SPAM_LABEL) {
        if let Err(err) = mailbox
            .modify_labels(restored_id, &[SPAM_LABEL.to_string()], &[])
            .await
        {
            warn!(restored_id, status = ?err.status(), "could not mark restored message as spam");
        }
    }
}

/// Lists content objects and returns their ids, sorted.
pub async fn backed_up_ids(store: &dyn ObjectStore) -> Result<Vec<String>, RunError> {
    let mut ids = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list_page(MESSAGES_PREFIX, token.as_deref()).await?;
        ids.extend(
            page.objects
                .iter()
                .filter_map(|entry| id_from_content_key(&entry.key))
                .map(str::to_string),
        );
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    ids.sort();
    ids.dedup();
    Ok(ids)
}

pub struct RestoreEngine<F: MailboxFactory> {
    restorer: Arc<Restorer>,
    factory: Arc<F>,
    policy: RetryPolicy,
    options: RestoreOptions,
}

impl<F: MailboxFactory> RestoreEngine<F> {
    pub fn new(
        state: Arc<StateStore>,
        store: Arc<dyn ObjectStore>,
        factory: Arc<F>,
        policy: RetryPolicy,
        options: RestoreOptions,
    ) -> Self {
        let restorer = Arc::new(Restorer {
            state,
            store,
            apply: options.apply,
            write_markers: options.write_markers,
        });
        Self {
            restorer,
            factory,
            policy,
            options,
        }
    }

    /// Decides and, when applying, performs the restore of one backed-up
    /// message. Does not take a claim.
    pub async fn restore_one<M: MailApi + ?Sized>(
        &self,
        mailbox: &M,
        id: &str,
    ) -> Result<RestoreDecision, ItemError> {
        self.restorer.restore_one(mailbox, id).await
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RestoreStats, RunError> {
        let store = self.restorer.store.clone();
        let candidates = backed_up_ids(store.as_ref()).await?;
        info!(
            candidates = candidates.len(),
            apply = self.options.apply,
            "starting restore"
        );

        let tally = Arc::new(RunTally::new(
            "restore",
            self.options.max_error_samples,
            self.options.progress_every,
        ));
        let handler = Arc::new(RestoreHandler {
            restorer: self.restorer.clone(),
            factory: self.factory.clone(),
            policy: self.policy.clone(),
            stale_claim_after: self.options.stale_claim_after,
        });
        let pipeline = Pipeline::start(handler, self.options.workers, tally.clone(), cancel);

        let mut budget = Budget::new(self.options.max_messages);
        for id in candidates {
            if budget.exhausted() || pipeline.is_stopped() {
                break;
            }
            if let Some(since) = self.options.since {
                if predates(store.as_ref(), &id, since).await {
                    continue;
                }
            }
            if !budget.admit() || !pipeline.submit(id).await {
                break;
            }
        }
        pipeline.finish().await?;

        let totals = tally.snapshot();
        let stats = RestoreStats {
            apply: self.options.apply,
            considered: budget.used(),
            restored: totals.done,
            skipped: totals.skipped,
            errors: totals.errors,
            error_samples: totals.samples,
            interrupted: cancel.is_cancelled(),
        };
        info!(
            apply = stats.apply,
            considered = stats.considered,
            restored = stats.restored,
            skipped = stats.skipped,
            errors = stats.errors,
            "restore finished"
        );
        Ok(stats)
    }
}

/// True only when the stored metadata has a parseable date before `since`.
async fn predates(store: &dyn ObjectStore, id: &str, since: NaiveDate) -> bool {
    match get_json_opt::<_, MessageMeta>(store, &meta_key(id)).await {
        Ok(Some(meta)) => meta.internal_date_utc().is_some_and(|day| day < since),
        Ok(None) => false,
        Err(err) => {
            debug!(message_id = %id, code = err.code(), "metadata unreadable, keeping candidate");
            false
        }
    }
}

struct RestoreHandler<F: MailboxFactory> {
    restorer: Arc<Restorer>,
    factory: Arc<F>,
    policy: RetryPolicy,
    stale_claim_after: Duration,
}

#[async_trait]
impl<F: MailboxFactory> ItemHandler for RestoreHandler<F> {
    type Worker = Retrying<F::Mailbox>;

    fn open_worker(&self, index: usize) -> Result<Self::Worker, ItemError> {
        self.factory
            .open(index)
            .map(|mailbox| Retrying::new(mailbox, self.policy.clone()))
            .map_err(|err| ItemError::Fatal(RunError::Mailbox(err)))
    }

    async fn handle(&self, mailbox: &Self::Worker, id: &str) -> Result<ItemOutcome, ItemError> {
        let state = &self.restorer.state;
        if state.was_restored(id).await? {
            return Ok(ItemOutcome::Skipped);
        }
        // Dry runs write nothing, so they do not claim either.
        let claimed = self.restorer.apply;
        if claimed
            && !state
                .claim(ClaimKind::Restore, id, self.stale_claim_after)
                .await?
        {
            return Ok(ItemOutcome::Skipped);
        }

        let work = self.restorer.restore_one(mailbox, id);
        let decision = if claimed {
            state.release_after(ClaimKind::Restore, id, work).await?
        } else {
            work.await?
        };
        Ok(match decision {
            RestoreDecision {
                did_restore: true, ..
            } => ItemOutcome::Done,
            _ => ItemOutcome::Skipped,
        })
    }
}
