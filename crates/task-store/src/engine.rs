//! SyncEngine: drains the mutation queue to the remote store and feeds
//! remote snapshots back into the repository.
//!
//! The engine is the only component that performs remote writes. It
//! takes ops off the repository's queue one at a time (per-task FIFO),
//! executes them against the `RemoteStore`, and reacts to the outcome:
//! - success confirms the op and clears any `sync_failed` flag
//! - transient failures reschedule the op with exponential backoff,
//!   indefinitely; past the failure threshold the task is flagged
//! - authorization failures drop the op and are surfaced as events
//! - a missing remote document drops a field update silently (the next
//!   snapshot removes the task locally anyway)
//!
//! Incoming changes arrive through a change subscription delivering
//! full snapshots, which `run` forwards to `TaskRepository::reconcile`.

use crate::backoff::{RetryConfig, retry_delay};
use crate::events::TaskEvent;
use crate::queue::Mutation;
use crate::repository::TaskRepository;
use crate::store::{
    RemoteSnapshot, RemoteStore, SnapshotEvent, StoreError, task_path, user_tasks_path,
};
use crate::task::UserId;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Tuning knobs for the sync loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    /// Consecutive failed attempts after which a task is flagged
    /// `sync_failed`. Retries continue regardless.
    pub failure_threshold: u32,
    /// How often the background loop polls the queue for due ops.
    pub flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            failure_threshold: 5,
            flush_interval: Duration::from_millis(200),
        }
    }
}

/// What happened to the single op a flush step processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The remote accepted the op.
    Confirmed,
    /// Transient failure; the op will be retried after backoff.
    Retrying,
    /// The op was dropped: superseded by a newer op, or its target
    /// document no longer exists remotely.
    Dropped,
    /// The remote rejected the op permanently. Not retried.
    Rejected,
}

/// Tally of one `flush_until_idle` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub confirmed: usize,
    pub retrying: usize,
    pub dropped: usize,
    pub rejected: usize,
}

impl FlushReport {
    fn record(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Confirmed => self.confirmed += 1,
            FlushOutcome::Retrying => self.retrying += 1,
            FlushOutcome::Dropped => self.dropped += 1,
            FlushOutcome::Rejected => self.rejected += 1,
        }
    }
}

/// Background synchronizer between a `TaskRepository` and its
/// `RemoteStore`.
pub struct SyncEngine<S: RemoteStore> {
    owner: UserId,
    repo: Arc<Mutex<TaskRepository<S>>>,
    store: Arc<S>,
    config: EngineConfig,
    online: AtomicBool,
}

impl<S: RemoteStore> SyncEngine<S> {
    pub fn new(
        owner: UserId,
        repo: Arc<Mutex<TaskRepository<S>>>,
        store: Arc<S>,
        config: EngineConfig,
    ) -> Self {
        Self {
            owner,
            repo,
            store,
            config,
            online: AtomicBool::new(true),
        }
    }

    /// Toggle connectivity. While offline no ops are sent; queued ops
    /// accumulate and replay in order once online again.
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Merge a remote snapshot into the repository.
    pub async fn deliver_snapshot(&self, snapshot: &RemoteSnapshot) {
        self.repo.lock().await.reconcile(snapshot);
    }

    /// Send the next due op, if any. Returns `None` when the queue has
    /// nothing sendable right now (empty, backing off, or blocked on an
    /// in-flight op), or while offline.
    pub async fn flush_once(&self) -> Option<FlushOutcome> {
        if !self.is_online() {
            return None;
        }

        let op = {
            let mut repo = self.repo.lock().await;
            repo.queue_mut().begin_next(Instant::now())?
        };

        // The repository lock is released during the remote call so
        // local mutations stay non-blocking while a send is in flight
        let path = task_path(&self.owner, &op.task_id);
        let result = match &op.mutation {
            Mutation::Set(task) => self.store.set_document(&path, task).await,
            Mutation::Update(fields) => self.store.update_fields(&path, fields).await,
            Mutation::Delete => self.store.delete_document(&path).await,
        };

        let mut repo = self.repo.lock().await;
        let outcome = match result {
            Ok(()) => {
                repo.queue_mut().remove(op.seq);
                match op.mutation {
                    Mutation::Set(_) => repo.confirm_create(&op.task_id),
                    Mutation::Delete => repo.confirm_delete(&op.task_id),
                    Mutation::Update(_) => {}
                }
                repo.clear_sync_failed(&op.task_id);
                debug!(task = %op.task_id, seq = op.seq, "op confirmed");
                FlushOutcome::Confirmed
            }
            Err(err) if err.is_transient() => {
                let delay = retry_delay(op.attempts + 1, &self.config.retry);
                match repo.queue_mut().fail(op.seq, Instant::now() + delay) {
                    Some(attempts) => {
                        warn!(
                            task = %op.task_id,
                            attempts,
                            ?delay,
                            error = %err,
                            "op failed, retrying after backoff"
                        );
                        if attempts >= self.config.failure_threshold {
                            repo.mark_sync_failed(&op.task_id);
                        }
                        FlushOutcome::Retrying
                    }
                    None => FlushOutcome::Dropped,
                }
            }
            Err(StoreError::NotFound(_)) => {
                // The document was removed remotely; the snapshot feed
                // will drop the local copy
                repo.queue_mut().remove(op.seq);
                debug!(task = %op.task_id, "target document gone, op dropped");
                FlushOutcome::Dropped
            }
            Err(err @ StoreError::PermissionDenied(_)) => {
                repo.queue_mut().remove(op.seq);
                repo.mark_sync_failed(&op.task_id);
                repo.events().emit(TaskEvent::PermissionDenied {
                    id: op.task_id.clone(),
                });
                error!(task = %op.task_id, error = %err, "op rejected by the backend");
                FlushOutcome::Rejected
            }
            Err(err) => {
                // Remaining non-transient failures (e.g. undecodable
                // store data): dropped, flagged, no auth event
                repo.queue_mut().remove(op.seq);
                repo.mark_sync_failed(&op.task_id);
                error!(task = %op.task_id, error = %err, "op failed permanently");
                FlushOutcome::Rejected
            }
        };
        Some(outcome)
    }

    /// Flush every op that is currently due. Ops that fail and enter
    /// backoff are not waited for.
    pub async fn flush_until_idle(&self) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(outcome) = self.flush_once().await {
            report.record(outcome);
        }
        report
    }

    /// Run the sync loop: subscribe to the user's task namespace,
    /// reconcile every incoming snapshot, and flush the queue on a
    /// timer. Resubscribes with backoff if the feed fails or closes.
    ///
    /// Runs until the enclosing task is dropped.
    pub async fn run(&self) {
        let namespace = user_tasks_path(&self.owner);
        let mut subscribe_attempts: u32 = 0;

        loop {
            let mut sub = match self.store.subscribe(&namespace).await {
                Ok(sub) => {
                    subscribe_attempts = 0;
                    sub
                }
                Err(err) => {
                    subscribe_attempts += 1;
                    let delay = retry_delay(subscribe_attempts, &self.config.retry);
                    warn!(error = %err, ?delay, "subscription failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            info!(%namespace, "subscribed to remote changes");

            let mut flush_tick = tokio::time::interval(self.config.flush_interval);
            flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = sub.recv() => match event {
                        Some(SnapshotEvent::Snapshot(snapshot)) => {
                            self.deliver_snapshot(&snapshot).await;
                        }
                        Some(SnapshotEvent::Error(err)) if err.is_transient() => {
                            warn!(error = %err, "change feed error");
                        }
                        Some(SnapshotEvent::Error(err)) => {
                            warn!(error = %err, "change feed failed, resubscribing");
                            break;
                        }
                        None => {
                            warn!("change feed closed, resubscribing");
                            break;
                        }
                    },
                    _ = flush_tick.tick() => {
                        self.flush_until_idle().await;
                    }
                }
            }
        }
    }
}
