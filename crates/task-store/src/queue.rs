//! Ordered queue of pending remote mutations.
//!
//! One logical op per task at a time: queued updates for the same task
//! coalesce field-wise (only the latest pending value per field is
//! kept), while a delete cancels everything else pending for its id and
//! is always sent. Ops move through
//! `Pending -> InFlight -> {confirmed | failed -> Pending}`; a failed
//! op that has been superseded by a newer op on the same task is folded
//! into the newer op instead of being retried.

use crate::task::{Task, TaskFields, TaskId};

use tokio::time::Instant;
use tracing::debug;

/// Remote effect of one local mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Write the whole document (task creation).
    Set(Task),
    /// Write only the given fields.
    Update(TaskFields),
    /// Remove the document.
    Delete,
}

/// Queue state of an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Waiting to be sent (possibly backing off after a failure).
    Pending,
    /// Handed to the engine; outcome not yet known.
    InFlight,
}

/// A queued remote operation for a single task.
#[derive(Debug, Clone)]
pub struct QueuedOp {
    pub task_id: TaskId,
    pub mutation: Mutation,
    pub state: OpState,
    /// Failed send attempts so far.
    pub attempts: u32,
    /// Earliest time the op may be (re)sent; `None` means immediately.
    pub not_before: Option<Instant>,
    /// Monotonic enqueue sequence, also the op's identity.
    pub seq: u64,
}

/// FIFO queue of pending remote operations with per-task coalescing.
#[derive(Debug, Default)]
pub struct MutationQueue {
    ops: Vec<QueuedOp>,
    next_seq: u64,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether any op (pending or in flight) exists for the task.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.ops.iter().any(|op| &op.task_id == id)
    }

    fn push(&mut self, task_id: TaskId, mutation: Mutation) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push(QueuedOp {
            task_id,
            mutation,
            state: OpState::Pending,
            attempts: 0,
            not_before: None,
            seq,
        });
    }

    /// Queue a whole-document write for a freshly created task.
    pub fn enqueue_set(&mut self, task: Task) {
        self.push(task.id.clone(), Mutation::Set(task));
    }

    /// Queue a field update, coalescing into any pending op for the
    /// same task.
    pub fn enqueue_update(&mut self, id: &TaskId, fields: TaskFields) {
        if let Some(op) = self
            .ops
            .iter_mut()
            .rev()
            .find(|op| &op.task_id == id && op.state == OpState::Pending)
        {
            match &mut op.mutation {
                Mutation::Set(task) => fields.apply_to(task),
                Mutation::Update(pending) => pending.merge(&fields),
                Mutation::Delete => {
                    // The repository rejects updates to deleted tasks,
                    // so this is unreachable through the public API
                    debug!(task = %id, "dropping update queued after delete");
                }
            }
            return;
        }
        // No pending op to coalesce into (queue empty for this id, or
        // only an in-flight op exists)
        self.push(id.clone(), Mutation::Update(fields));
    }

    /// Queue a delete, cancelling all pending ops for the task. The
    /// delete itself is always sent, even for never-synced tasks.
    pub fn enqueue_delete(&mut self, id: &TaskId) {
        self.ops
            .retain(|op| &op.task_id != id || op.state == OpState::InFlight);
        self.push(id.clone(), Mutation::Delete);
    }

    /// Hand out the next sendable op, marking it in flight.
    ///
    /// An op is sendable when it is pending, its backoff deadline has
    /// passed, and no earlier op for the same task is in flight (sends
    /// stay FIFO per task).
    pub fn begin_next(&mut self, now: Instant) -> Option<QueuedOp> {
        let in_flight: Vec<TaskId> = self
            .ops
            .iter()
            .filter(|op| op.state == OpState::InFlight)
            .map(|op| op.task_id.clone())
            .collect();

        let op = self.ops.iter_mut().find(|op| {
            op.state == OpState::Pending
                && op.not_before.is_none_or(|t| t <= now)
                && !in_flight.contains(&op.task_id)
        })?;
        op.state = OpState::InFlight;
        Some(op.clone())
    }

    /// Remove an op from the queue (confirmed, or dropped without
    /// retry).
    pub fn remove(&mut self, seq: u64) {
        self.ops.retain(|op| op.seq != seq);
    }

    /// Record a transient failure for an in-flight op.
    ///
    /// If a newer op for the same task has been queued meanwhile, the
    /// failed op is folded into it and dropped (`None`). Otherwise the
    /// op returns to `Pending` with its backoff deadline set, and the
    /// new attempt count is returned.
    pub fn fail(&mut self, seq: u64, retry_at: Instant) -> Option<u32> {
        let idx = self.ops.iter().position(|op| op.seq == seq)?;
        let failed_task = self.ops[idx].task_id.clone();

        let superseding = self
            .ops
            .iter()
            .position(|op| op.seq != seq && op.task_id == failed_task);

        let Some(newer_idx) = superseding else {
            let op = &mut self.ops[idx];
            op.state = OpState::Pending;
            op.attempts += 1;
            op.not_before = Some(retry_at);
            return Some(op.attempts);
        };

        // Fold the failed op into the newer one, then drop it
        let failed = self.ops.remove(idx);
        let newer_idx = if newer_idx > idx { newer_idx - 1 } else { newer_idx };
        let newer = &mut self.ops[newer_idx];
        match (&failed.mutation, &mut newer.mutation) {
            // Delete cancels anything that came before it
            (_, Mutation::Delete) => {}
            // A newer full write already carries everything
            (_, Mutation::Set(_)) => {}
            // Unsent creation: the newer fields must ride on the full
            // document write, since the document does not exist yet
            (Mutation::Set(task), Mutation::Update(fields)) => {
                let mut task = task.clone();
                fields.apply_to(&mut task);
                newer.mutation = Mutation::Set(task);
            }
            // Field update folded under the newer one; newer fields win
            (Mutation::Update(failed_fields), Mutation::Update(fields)) => {
                let mut combined = failed_fields.clone();
                combined.merge(fields);
                *fields = combined;
            }
            (Mutation::Delete, Mutation::Update(_)) => {
                // Unreachable: enqueue_delete cancels pending updates
                // and the repository rejects updates after delete
                debug!(task = %failed.task_id, "update queued behind delete dropped");
            }
        }
        debug!(task = %failed.task_id, seq, "failed op superseded by newer op");
        None
    }
}
