//! Mailbox → object storage.
//!
//! A run first adopts the remote state mirror if the local document is empty,
//! then walks the change log from the stored cursor when a full scan has
//! completed before, and falls back to listing the whole mailbox otherwise
//! (or when the cursor has expired). Each history page is checkpointed as
//! soon as its messages are handled. The run ends by stamping `lastRunAt` and
//! mirroring the state document to storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{ItemError, RunError};
use crate::gmail::{CONTROL_HANDLE, FetchedMessage, MailApi, MailboxFactory, Retrying};
use crate::message::gzip;
use crate::retry::RetryPolicy;
use crate::state::{ClaimKind, StatePatch, StateStore};
use crate::storage::{
    GZIP_CONTENT_TYPE, ObjectStore, STATE_KEY, content_key, get_json_opt, meta_key, put_json,
};
use crate::worker::{Budget, ItemHandler, ItemOutcome, Pipeline, RunTally};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Lower bound for full scans, sent as `after:YYYY/MM/DD`.
    pub since: Option<NaiveDate>,
    /// Stop after this many ids. A capped full scan does not count as
    /// complete.
    pub max_messages: Option<u64>,
    pub workers: usize,
    pub gzip_level: u32,
    pub max_error_samples: usize,
    pub progress_every: u64,
    pub stale_claim_after: Duration,
}

impl BackupOptions {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            since: None,
            max_messages: None,
            workers: sync.workers,
            gzip_level: sync.gzip_level,
            max_error_samples: sync.max_error_samples,
            progress_every: sync.progress_every,
            stale_claim_after: Duration::from_secs(sync.stale_claim_secs),
        }
    }
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupMode {
    Incremental,
    #[default]
    FullScan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStats {
    pub mode: BackupMode,
    pub uploaded: u64,
    pub skipped: u64,
    pub errors: u64,
    pub error_samples: Vec<String>,
    /// The run stopped at `max_messages`.
    pub capped: bool,
    /// The run was cancelled before enumeration finished.
    pub interrupted: bool,
}

impl BackupStats {
    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

/// How a reconciliation pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassEnd {
    Completed,
    Capped,
    Interrupted,
    CursorExpired,
}

fn scan_query(since: Option<NaiveDate>) -> Option<String> {
    since.map(|day| format!("after:{}", day.format("%Y/%m/%d")))
}

pub struct BackupEngine<F: MailboxFactory> {
    state: Arc<StateStore>,
    store: Arc<dyn ObjectStore>,
    factory: Arc<F>,
    policy: RetryPolicy,
    options: BackupOptions,
}

impl<F: MailboxFactory> BackupEngine<F> {
    pub fn new(
        state: Arc<StateStore>,
        store: Arc<dyn ObjectStore>,
        factory: Arc<F>,
        policy: RetryPolicy,
        options: BackupOptions,
    ) -> Self {
        Self {
            state,
            store,
            factory,
            policy,
            options,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<BackupStats, RunError> {
        self.bootstrap_state().await?;

        let tally = Arc::new(RunTally::new(
            "backup",
            self.options.max_error_samples,
            self.options.progress_every,
        ));
        let pass = self.reconcile(tally.clone(), cancel).await;

        let (mode, end) = match pass {
            Ok(result) => {
                self.state
                    .patch_state(StatePatch::new().last_run_at(Utc::now().timestamp()))
                    .await?;
                self.mirror_state().await?;
                result
            }
            Err(err) => {
                if let Err(mirror_err) = self.mirror_state().await {
                    warn!(error = %mirror_err, "could not mirror state after failed run");
                }
                return Err(err);
            }
        };

        let totals = tally.snapshot();
        let stats = BackupStats {
            mode,
            uploaded: totals.done,
            skipped: totals.skipped,
            errors: totals.errors,
            error_samples: totals.samples,
            capped: end == PassEnd::Capped,
            interrupted: end == PassEnd::Interrupted,
        };
        info!(
            mode = ?stats.mode,
            uploaded = stats.uploaded,
            skipped = stats.skipped,
            errors = stats.errors,
            capped = stats.capped,
            interrupted = stats.interrupted,
            "backup finished"
        );
        Ok(stats)
    }

    /// Pulls `state/state.json` from storage when there is no local document,
    /// e.g. on a new machine.
    async fn bootstrap_state(&self) -> Result<(), RunError> {
        if !self.state.read_state_raw().await?.is_empty() {
            return Ok(());
        }
        match get_json_opt::<_, Value>(self.store.as_ref(), STATE_KEY).await? {
            Some(Value::Object(remote)) if !remote.is_empty() => {
                self.state.adopt_remote_state(remote).await?;
            }
            Some(Value::Object(_)) | None => {}
            Some(_) => warn!("remote state mirror is not an object, ignoring it"),
        }
        Ok(())
    }

    async fn mirror_state(&self) -> Result<(), RunError> {
        let raw = self.state.read_state_raw().await?;
        put_json(self.store.as_ref(), STATE_KEY, &raw).await?;
        debug!("mirrored state document");
        Ok(())
    }

    async fn reconcile(
        &self,
        tally: Arc<RunTally>,
        cancel: &CancellationToken,
    ) -> Result<(BackupMode, PassEnd), RunError> {
        let control = Retrying::new(self.factory.open(CONTROL_HANDLE)?, self.policy.clone());
        let handler = Arc::new(UploadHandler {
            factory: self.factory.clone(),
            policy: self.policy.clone(),
            state: self.state.clone(),
            store: self.store.clone(),
            gzip_level: self.options.gzip_level,
            stale_claim_after: self.options.stale_claim_after,
        });
        let mut budget = Budget::new(self.options.max_messages);

        let doc = self.state.read_state().await?;
        if let (true, Some(cursor)) = (doc.incremental_ready(), doc.history_id.clone()) {
            info!(cursor = %cursor, "starting incremental backup");
            let end = self
                .incremental(&control, &cursor, &handler, &tally, &mut budget, cancel)
                .await?;
            if end != PassEnd::CursorExpired {
                return Ok((BackupMode::Incremental, end));
            }
            warn!(cursor = %cursor, "change cursor expired, falling back to a full scan");
        } else {
            info!(since = ?self.options.since, "starting full scan");
        }

        let end = self
            .full_scan(&control, &handler, &tally, &mut budget, cancel)
            .await?;
        Ok((BackupMode::FullScan, end))
    }

    async fn incremental<M: MailApi>(
        &self,
        control: &M,
        cursor: &str,
        handler: &Arc<UploadHandler<F>>,
        tally: &Arc<RunTally>,
        budget: &mut Budget,
        cancel: &CancellationToken,
    ) -> Result<PassEnd, RunError> {
        let mut page_token: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return Ok(PassEnd::Interrupted);
            }
            let page = match control.history_added(cursor, page_token.as_deref()).await {
                Ok(page) => page,
                Err(err) if err.is_not_found() => return Ok(PassEnd::CursorExpired),
                Err(err) => return Err(err.into()),
            };

            let pipeline =
                Pipeline::start(handler.clone(), self.options.workers, tally.clone(), cancel);
            for id in page.ids {
                if !budget.admit() || !pipeline.submit(id).await {
                    break;
                }
            }
            pipeline.finish().await?;

            if cancel.is_cancelled() {
                return Ok(PassEnd::Interrupted);
            }
            if budget.exhausted() {
                return Ok(PassEnd::Capped);
            }
            if let Some(next) = page.history_id {
                self.state
                    .patch_state(StatePatch::new().history_id(next.as_str()))
                    .await?;
                debug!(cursor = %next, "checkpointed change cursor");
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(PassEnd::Completed),
            }
        }
    }

    async fn full_scan<M: MailApi>(
        &self,
        control: &M,
        handler: &Arc<UploadHandler<F>>,
        tally: &Arc<RunTally>,
        budget: &mut Budget,
        cancel: &CancellationToken,
    ) -> Result<PassEnd, RunError> {
        let query = scan_query(self.options.since);
        let pipeline = Pipeline::start(handler.clone(), self.options.workers, tally.clone(), cancel);
        let enumerated = enumerate(control, query.as_deref(), &pipeline, budget).await;
        let drained = pipeline.finish().await;
        enumerated?;
        drained?;

        if cancel.is_cancelled() {
            info!("full scan interrupted, leaving scan state untouched");
            return Ok(PassEnd::Interrupted);
        }
        if budget.exhausted() {
            self.state
                .patch_state(StatePatch::new().full_scan_complete(false))
                .await?;
            info!(listed = budget.used(), "full scan capped, next run keeps scanning");
            return Ok(PassEnd::Capped);
        }

        let profile = control.profile().await?;
        let mut patch = StatePatch::new().full_scan_complete(true);
        if let Some(cursor) = profile.history_id {
            patch = patch.history_id(cursor);
        }
        if let Some(email) = profile.email_address {
            patch = patch.email_address(email);
        }
        self.state.patch_state(patch).await?;
        info!(listed = budget.used(), "full scan complete");
        Ok(PassEnd::Completed)
    }
}

/// Feeds listing pages into `pipeline` until the listing ends, the budget
/// runs out, or the pipeline stops.
async fn enumerate<M: MailApi>(
    control: &M,
    query: Option<&str>,
    pipeline: &Pipeline,
    budget: &mut Budget,
) -> Result<(), RunError> {
    let mut page_token: Option<String> = None;
    loop {
        if pipeline.is_stopped() {
            return Ok(());
        }
        let page = control.list_ids(query, page_token.as_deref()).await?;
        for id in page.ids {
            if !budget.admit() || !pipeline.submit(id).await {
                return Ok(());
            }
        }
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(()),
        }
    }
}

struct UploadHandler<F: MailboxFactory> {
    factory: Arc<F>,
    policy: RetryPolicy,
    state: Arc<StateStore>,
    store: Arc<dyn ObjectStore>,
    gzip_level: u32,
    stale_claim_after: Duration,
}

impl<F: MailboxFactory> UploadHandler<F> {
    async fn transfer(
        &self,
        mailbox: &Retrying<F::Mailbox>,
        id: &str,
    ) -> Result<ItemOutcome, ItemError> {
        let FetchedMessage { raw, meta } = mailbox.fetch_raw(id).await?;
        let level = self.gzip_level;
        let compressed = tokio::task::spawn_blocking(move || gzip(&raw, level))
            .await
            .map_err(|err| ItemError::Fatal(RunError::Worker(err.to_string())))??;

        self.store
            .put(&content_key(id), compressed, GZIP_CONTENT_TYPE)
            .await?;
        put_json(self.store.as_ref(), &meta_key(id), &meta).await?;
        self.state.mark_transferred(id).await?;
        debug!(message_id = %id, "uploaded message");
        Ok(ItemOutcome::Done)
    }
}

#[async_trait]
impl<F: MailboxFactory> ItemHandler for UploadHandler<F> {
    type Worker = Retrying<F::Mailbox>;

    fn open_worker(&self, index: usize) -> Result<Self::Worker, ItemError> {
        self.factory
            .open(index)
            .map(|mailbox| Retrying::new(mailbox, self.policy.clone()))
            .map_err(|err| ItemError::Fatal(RunError::Mailbox(err)))
    }

    async fn handle(&self, mailbox: &Self::Worker, id: &str) -> Result<ItemOutcome, ItemError> {
        if !self
            .state
            .claim(ClaimKind::Upload, id, self.stale_claim_after)
            .await?
        {
            return Ok(ItemOutcome::Skipped);
        }
        self.state
            .release_after(ClaimKind::Upload, id, self.transfer(mailbox, id))
            .await
    }
}
