//! Bounded worker pool shared by the backup and restore engines.
//!
//! A producer submits message ids while `workers` tasks drain them. At most
//! `4 × workers` ids are outstanding (queued or in progress) at once, so
//! enumeration of a large mailbox blocks instead of buffering every id.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ItemError, RunError};

/// Outstanding ids allowed per worker.
pub const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The message was transferred (or, in a dry run, would have been).
    Done,
    Skipped,
}

#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    /// Per-worker state, typically the worker's own mailbox client.
    type Worker: Send + Sync + 'static;

    fn open_worker(&self, index: usize) -> Result<Self::Worker, ItemError>;

    async fn handle(&self, worker: &Self::Worker, id: &str) -> Result<ItemOutcome, ItemError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TallySnapshot {
    pub done: u64,
    pub skipped: u64,
    pub errors: u64,
    pub samples: Vec<String>,
}

impl TallySnapshot {
    pub fn processed(&self) -> u64 {
        self.done + self.skipped + self.errors
    }
}

/// Run-wide counters. One tally outlives every pool of a run so that
/// history pages and the full scan add up into one set of stats.
#[derive(Debug)]
pub struct RunTally {
    phase: &'static str,
    max_samples: usize,
    progress_every: u64,
    started: Instant,
    done: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    samples: Mutex<Vec<String>>,
}

impl RunTally {
    pub fn new(phase: &'static str, max_samples: usize, progress_every: u64) -> Self {
        Self {
            phase,
            max_samples,
            progress_every,
            started: Instant::now(),
            done: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            samples: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, id: &str, result: &Result<ItemOutcome, ItemError>) {
        match result {
            Ok(ItemOutcome::Done) => {
                self.done.fetch_add(1, Ordering::SeqCst);
            }
            Ok(ItemOutcome::Skipped) => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => self.record_error(id, &err.to_string()),
        }
        self.maybe_report();
    }

    fn record_error(&self, id: &str, sanitized: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let mut samples = self.samples.lock().expect("lock samples");
        if samples.len() < self.max_samples {
            samples.push(format!("{id}: {sanitized}"));
        }
    }

    fn maybe_report(&self) {
        if self.progress_every == 0 {
            return;
        }
        let snapshot = self.counts();
        let processed = snapshot.processed();
        if processed == 0 || processed % self.progress_every != 0 {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
        info!(
            phase = self.phase,
            processed,
            rate_per_sec = processed as f64 / elapsed,
            done = snapshot.done,
            skipped = snapshot.skipped,
            errors = snapshot.errors,
            "progress"
        );
    }

    fn counts(&self) -> TallySnapshot {
        TallySnapshot {
            done: self.done.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            samples: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            samples: self.samples.lock().expect("lock samples").clone(),
            ..self.counts()
        }
    }
}

/// Counts admitted ids against an optional cap.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    limit: Option<u64>,
    used: u64,
}

impl Budget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit: limit.filter(|limit| *limit > 0),
            used: 0,
        }
    }

    pub fn admit(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.used >= limit)
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

type Slot = (String, OwnedSemaphorePermit);

/// One bounded pool. Start it, submit ids, then `finish` it.
pub struct Pipeline {
    sender: mpsc::Sender<Slot>,
    slots: Arc<Semaphore>,
    stop: CancellationToken,
    fatal: Arc<Mutex<Option<RunError>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns `workers` tasks (at least one). `cancel` stops the pool early;
    /// items already in progress still finish.
    pub fn start<H: ItemHandler>(
        handler: Arc<H>,
        workers: usize,
        tally: Arc<RunTally>,
        cancel: &CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let depth = workers * QUEUE_DEPTH_PER_WORKER;
        let (sender, receiver) = mpsc::channel::<Slot>(depth);
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let stop = cancel.child_token();
        let fatal = Arc::new(Mutex::new(None));

        let tasks = (0..workers)
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    handler.clone(),
                    receiver.clone(),
                    tally.clone(),
                    stop.clone(),
                    fatal.clone(),
                ))
            })
            .collect();

        Self {
            sender,
            slots: Arc::new(Semaphore::new(depth)),
            stop,
            fatal,
            tasks,
        }
    }

    /// Queues one id, waiting while the pool is saturated. Returns false once
    /// the pool has stopped, after which the producer should stop too.
    pub async fn submit(&self, id: String) -> bool {
        let permit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return false,
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };
        self.sender.send((id, permit)).await.is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Waits for every queued id to be handled (or dropped, if the pool was
    /// stopped) and surfaces the first fatal error.
    pub async fn finish(self) -> Result<(), RunError> {
        let Pipeline {
            sender,
            fatal,
            tasks,
            ..
        } = self;
        drop(sender);

        let mut join_failure = None;
        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                error!(error = %err, "worker task ended abnormally");
                join_failure.get_or_insert_with(|| RunError::Worker(err.to_string()));
            }
        }

        let fatal = fatal.lock().expect("lock fatal").take();
        match fatal.or(join_failure) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_worker<H: ItemHandler>(
    index: usize,
    handler: Arc<H>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Slot>>>,
    tally: Arc<RunTally>,
    stop: CancellationToken,
    fatal: Arc<Mutex<Option<RunError>>>,
) {
    let mut state: Option<H::Worker> = None;
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                slot = receiver.recv() => slot,
            }
        };
        let Some((id, _permit)) = next else {
            break;
        };

        if state.is_none() {
            match handler.open_worker(index) {
                Ok(opened) => {
                    debug!(worker = index, "opened worker");
                    state = Some(opened);
                }
                Err(err) => {
                    stop_with(&stop, &fatal, err);
                    break;
                }
            }
        }
        let Some(worker) = state.as_ref() else {
            break;
        };

        let result = AssertUnwindSafe(handler.handle(worker, &id))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|msg| msg.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panic".to_string());
                warn!(message_id = %id, "item handler panicked: {message}");
                Err(ItemError::Failed("Panic".to_string()))
            });

        match result {
            Err(ItemError::Fatal(err)) => {
                error!(message_id = %id, error = %err, "fatal error, stopping workers");
                stop_with(&stop, &fatal, ItemError::Fatal(err));
                break;
            }
            other => {
                if let Err(err) = &other {
                    warn!(message_id = %id, error = %err, "item failed");
                }
                tally.record(&id, &other);
            }
        }
    }
}

fn stop_with(stop: &CancellationToken, fatal: &Mutex<Option<RunError>>, err: ItemError) {
    let err = match err {
        ItemError::Fatal(err) => err,
        ItemError::Failed(reason) => RunError::Worker(reason),
    };
    fatal.lock().expect("lock fatal").get_or_insert(err);
    stop.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::state::StateError;

    #[derive(Default)]
    struct ScriptedHandler {
        opened: Mutex<Vec<usize>>,
        seen: Mutex<HashSet<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ItemHandler for ScriptedHandler {
        type Worker = usize;

        fn open_worker(&self, index: usize) -> Result<usize, ItemError> {
            self.opened.lock().expect("lock opened").push(index);
            Ok(index)
        }

        async fn handle(&self, _worker: &usize, id: &str) -> Result<ItemOutcome, ItemError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().expect("lock seen").insert(id.to_string());

            match id {
                id if id.starts_with("skip") => Ok(ItemOutcome::Skipped),
                id if id.starts_with("fail") => Err(ItemError::Failed("HttpError(status=404)".into())),
                id if id.starts_with("panic") => panic!("boom"),
                id if id.starts_with("fatal") => Err(ItemError::Fatal(RunError::State(
                    StateError::LockHeld(PathBuf::from("/x")),
                ))),
                _ => Ok(ItemOutcome::Done),
            }
        }
    }

    fn tally() -> Arc<RunTally> {
        Arc::new(RunTally::new("test", 2, 0))
    }

    #[test]
    fn budget_caps_admissions() {
        let mut unlimited = Budget::new(None);
        assert!((0..10_000).all(|_| unlimited.admit()));
        assert!(!unlimited.exhausted());

        let mut zero_is_unlimited = Budget::new(Some(0));
        assert!(zero_is_unlimited.admit());

        let mut capped = Budget::new(Some(2));
        assert!(capped.admit());
        assert!(!capped.exhausted());
        assert!(capped.admit());
        assert!(capped.exhausted());
        assert!(!capped.admit());
        assert_eq!(capped.used(), 2);
    }

    #[tokio::test]
    async fn every_submitted_id_is_counted_once() {
        let handler = Arc::new(ScriptedHandler::default());
        let tally = tally();
        let pipeline = Pipeline::start(handler.clone(), 2, tally.clone(), &CancellationToken::new());

        for id in ["a", "skip-b", "fail-c"] {
            assert!(pipeline.submit(id.to_string()).await);
        }
        pipeline.finish().await.expect("finish");

        let stats = tally.snapshot();
        assert_eq!((stats.done, stats.skipped, stats.errors), (1, 1, 1));
        assert_eq!(stats.processed(), 3);
        assert_eq!(stats.samples, vec!["fail-c: HttpError(status=404)".to_string()]);
    }

    #[tokio::test]
    async fn samples_are_bounded_and_panics_count_as_errors() {
        let handler = Arc::new(ScriptedHandler::default());
        let tally = tally();
        let pipeline = Pipeline::start(handler, 1, tally.clone(), &CancellationToken::new());

        for id in ["fail-1", "panic-2", "fail-3", "ok"] {
            assert!(pipeline.submit(id.to_string()).await);
        }
        pipeline.finish().await.expect("panics are not fatal");

        let stats = tally.snapshot();
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.samples.len(), 2);
        assert_eq!(stats.samples[1], "panic-2: Panic");
    }

    #[tokio::test]
    async fn fatal_error_stops_pool_and_surfaces() {
        let handler = Arc::new(ScriptedHandler::default());
        let tally = tally();
        let pipeline = Pipeline::start(handler, 1, tally.clone(), &CancellationToken::new());

        assert!(pipeline.submit("fatal-1".to_string()).await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !pipeline.is_stopped() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool stops");
        assert!(!pipeline.submit("after".to_string()).await);

        let err = pipeline.finish().await.expect_err("fatal surfaces");
        assert!(err.is_lock_held());
        assert_eq!(tally.snapshot().processed(), 0);
    }

    #[tokio::test]
    async fn each_worker_opens_its_own_state_and_concurrency_is_bounded() {
        let handler = Arc::new(ScriptedHandler {
            delay: Some(Duration::from_millis(10)),
            ..ScriptedHandler::default()
        });
        let tally = tally();
        let pipeline = Pipeline::start(handler.clone(), 3, tally.clone(), &CancellationToken::new());

        for n in 0..30 {
            assert!(pipeline.submit(format!("m{n}")).await);
        }
        pipeline.finish().await.expect("finish");

        assert_eq!(tally.snapshot().done, 30);
        assert_eq!(handler.seen.lock().expect("lock").len(), 30);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        let mut opened = handler.opened.lock().expect("lock").clone();
        opened.sort_unstable();
        opened.dedup();
        assert_eq!(opened.len(), handler.opened.lock().expect("lock").len());
    }

    #[tokio::test]
    async fn cancellation_rejects_new_submissions() {
        let handler = Arc::new(ScriptedHandler::default());
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::start(handler, 2, tally(), &cancel);

        cancel.cancel();
        assert!(!pipeline.submit("late".to_string()).await);
        pipeline.finish().await.expect("cancelled pool finishes cleanly");
    }
}
