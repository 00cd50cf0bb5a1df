//! TaskRepository: single serialized owner of a user's task set.
//!
//! Every UI intent goes through one of the mutation methods here, which
//! apply the change locally first (optimistic), queue the remote
//! effect, and notify observers. Remote snapshots flow back in through
//! `reconcile`, which merges them deterministically: per task, the
//! higher `version` wins and ties favor the remote copy, since the
//! remote represents confirmed durable state.
//!
//! Local mutations never fail due to connectivity; only validation and
//! unknown-id errors are synchronous. Remote failures never roll back
//! local state - the task is flagged `sync_failed` instead and the user
//! decides.

use crate::events::{EventBus, Subscription, TaskEvent};
use crate::queue::MutationQueue;
use crate::store::{RemoteSnapshot, RemoteStore};
use crate::task::{Task, TaskFields, TaskId, UserId};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Task text cannot be empty")]
    EmptyText,

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Canonical in-process view of one user's tasks.
pub struct TaskRepository<S: RemoteStore> {
    owner: UserId,
    store: Arc<S>,
    tasks: HashMap<TaskId, Task>,
    /// Created locally, full-document write not yet confirmed. These
    /// survive reconciliation even when absent from the snapshot.
    pending_creates: HashSet<TaskId>,
    /// Deleted locally, remote delete not yet confirmed. Snapshots may
    /// still carry them; they must not be resurrected.
    pending_deletes: HashSet<TaskId>,
    queue: MutationQueue,
    events: Arc<EventBus>,
}

impl<S: RemoteStore> TaskRepository<S> {
    pub fn new(owner: UserId, store: Arc<S>) -> Self {
        Self {
            owner,
            store,
            tasks: HashMap::new(),
            pending_creates: HashSet::new(),
            pending_deletes: HashSet::new(),
            queue: MutationQueue::new(),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Subscribe to change notifications. Dropping the handle
    /// unsubscribes.
    pub fn subscribe(
        &self,
        callback: impl Fn(TaskEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(callback)
    }

    /// The current task set, ordered by id for stable iteration.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut MutationQueue {
        &mut self.queue
    }

    /// Create a task from user input.
    ///
    /// Rejects text that trims to empty. Otherwise the task is visible
    /// locally immediately with a freshly generated id, the
    /// full-document write is queued, and observers are notified before
    /// this returns.
    pub fn create(&mut self, text: &str) -> Result<Task> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RepositoryError::EmptyText);
        }

        let id = self.store.generate_id();
        let task = Task::new(id.clone(), self.owner.clone(), text);
        self.tasks.insert(id.clone(), task.clone());
        self.pending_creates.insert(id.clone());
        self.queue.enqueue_set(task.clone());
        debug!(task = %id, "created task");
        self.notify_list_changed();
        Ok(task)
    }

    /// Set the completion flag. Applied locally at once; the field
    /// update is queued.
    pub fn set_checked(&mut self, id: &TaskId, value: bool) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::UnknownTask(id.clone()))?;
        task.is_checked = value;
        task.version += 1;
        let fields = TaskFields::checked(value, task.version);
        self.queue.enqueue_update(id, fields);
        debug!(task = %id, checked = value, "toggled task");
        self.notify_list_changed();
        Ok(())
    }

    /// Edit the task text. Returns `false` without queueing anything
    /// when the new text equals the current text.
    pub fn edit_text(&mut self, id: &TaskId, new_text: &str) -> Result<bool> {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return Err(RepositoryError::EmptyText);
        }
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::UnknownTask(id.clone()))?;
        if task.text == new_text {
            debug!(task = %id, "edit with unchanged text ignored");
            return Ok(false);
        }
        task.text = new_text.to_string();
        task.version += 1;
        let fields = TaskFields::text(new_text, task.version);
        self.queue.enqueue_update(id, fields);
        debug!(task = %id, "edited task text");
        self.notify_list_changed();
        Ok(true)
    }

    /// Delete a task. Removed locally at once; the remote delete is
    /// queued and cancels any other pending ops for the id.
    pub fn delete(&mut self, id: &TaskId) -> Result<()> {
        if self.tasks.remove(id).is_none() {
            return Err(RepositoryError::UnknownTask(id.clone()));
        }
        self.pending_creates.remove(id);
        self.pending_deletes.insert(id.clone());
        self.queue.enqueue_delete(id);
        debug!(task = %id, "deleted task");
        self.notify_list_changed();
        Ok(())
    }

    /// Merge a full remote snapshot into local state.
    ///
    /// Called only by the sync engine, on the same serialization point
    /// as the mutation methods. Deterministic regardless of arrival
    /// order:
    /// - remote-only tasks are added, unless pending local deletion
    /// - local-only tasks are removed, unless pending local creation
    /// - for tasks in both, the higher `version` wins; on a tie the
    ///   remote copy is taken
    pub fn reconcile(&mut self, snapshot: &RemoteSnapshot) {
        for (id, remote) in &snapshot.tasks {
            if self.pending_deletes.contains(id) {
                continue;
            }
            // The remote has the document, so any pending creation for
            // this id is durable
            self.pending_creates.remove(id);

            match self.tasks.get_mut(id) {
                None => {
                    self.tasks.insert(id.clone(), remote.clone());
                }
                Some(local) => {
                    if remote.version >= local.version {
                        let sync_failed = local.sync_failed;
                        *local = remote.clone();
                        local.sync_failed = sync_failed;
                    }
                    // Local copy is newer: an unsent local edit wins
                    // until the queue catches the remote up
                }
            }
        }

        // Remote deletions confirmed by their absence
        self.pending_deletes
            .retain(|id| snapshot.tasks.contains_key(id));

        self.tasks.retain(|id, _| {
            snapshot.tasks.contains_key(id) || self.pending_creates.contains(id)
        });

        debug!(
            tasks = self.tasks.len(),
            snapshot = snapshot.len(),
            "reconciled remote snapshot"
        );
        self.notify_list_changed();
    }

    /// Flag a task whose queued writes keep failing. Local state is
    /// kept as-is; the flag is informational and retries continue.
    pub(crate) fn mark_sync_failed(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            if !task.sync_failed {
                task.sync_failed = true;
                self.events.emit(TaskEvent::SyncFailed { id: id.clone() });
                self.notify_list_changed();
            }
        }
    }

    pub(crate) fn clear_sync_failed(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            if task.sync_failed {
                task.sync_failed = false;
                self.notify_list_changed();
            }
        }
    }

    /// The remote confirmed the full-document write for a created task.
    pub(crate) fn confirm_create(&mut self, id: &TaskId) {
        self.pending_creates.remove(id);
    }

    /// The remote confirmed a delete.
    pub(crate) fn confirm_delete(&mut self, id: &TaskId) {
        self.pending_deletes.remove(id);
    }

    fn notify_list_changed(&self) {
        self.events.emit(TaskEvent::ListChanged {
            tasks: self.tasks(),
        });
    }
}
