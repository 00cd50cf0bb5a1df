//! RemoteStore trait abstraction over the persistence backend.
//!
//! Implementations:
//! - `InMemoryStore` - For testing, with fault injection and an op log
//! - `JsonFileStore` (in task-cli) - Persists to a JSON file via tokio::fs
//!
//! Tasks live under a per-user namespace: `tasks/{user}/{task}`. Every
//! operation is asynchronous and fallible; errors are classified as
//! transient (retried by the sync engine) or permanent (surfaced).

use crate::task::{Task, TaskFields, TaskId, UserId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    /// The backend returned data that could not be decoded. Retrying
    /// cannot help; the store needs repair.
    #[error("Malformed store data: {0}")]
    Corrupt(String),

    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether the sync engine should retry the failed operation.
    /// Permission failures, missing documents, and undecodable data
    /// are final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::Other(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Namespace for a user's task documents.
pub fn user_tasks_path(owner: &UserId) -> String {
    format!("tasks/{}", owner)
}

/// Document path for a single task.
pub fn task_path(owner: &UserId, id: &TaskId) -> String {
    format!("tasks/{}/{}", owner, id)
}

/// The full remote task set for one user, as delivered by a change
/// subscription. Always a complete view, never a delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub tasks: HashMap<TaskId, Task>,
}

impl RemoteSnapshot {
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
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
}

/// Event delivered on a change subscription.
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    /// A full snapshot of the subscribed task set.
    Snapshot(RemoteSnapshot),
    /// The backend reported a feed error. Transient errors mean the
    /// feed may recover; permanent ones require resubscribing.
    Error(StoreError),
}

/// Handle to an active change subscription.
///
/// Follows the disposer pattern: hold this value to keep receiving
/// snapshots, drop it to unsubscribe (the store prunes the closed
/// channel on its next delivery).
pub struct ChangeSubscription {
    rx: mpsc::UnboundedReceiver<SnapshotEvent>,
}

impl ChangeSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<SnapshotEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event. Returns `None` once the store side is
    /// gone.
    pub async fn recv(&mut self) -> Option<SnapshotEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for tests and single-shot consumers.
    pub fn try_recv(&mut self) -> Option<SnapshotEvent> {
        self.rx.try_recv().ok()
    }
}

/// Remote persistence backend for task documents.
///
/// Implementations must be `Send + Sync`; the engine calls them from a
/// background flush task.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Generate a unique document id. Purely local, never touches the
    /// network, so creation stays non-blocking while offline.
    fn generate_id(&self) -> TaskId;

    /// Write a whole task document, creating or replacing it.
    async fn set_document(&self, path: &str, task: &Task) -> Result<()>;

    /// Write only the given fields of an existing document.
    async fn update_fields(&self, path: &str, fields: &TaskFields) -> Result<()>;

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete_document(&self, path: &str) -> Result<()>;

    /// Subscribe to the task set under `path` (a user namespace).
    /// The current snapshot is delivered immediately as the first
    /// event; dropping the handle unsubscribes.
    async fn subscribe(&self, path: &str) -> Result<ChangeSubscription>;
}

// Implement RemoteStore for Arc<T> where T: RemoteStore.
// This allows sharing one store between the repository, the engine,
// and a test harness.
#[async_trait]
impl<T: RemoteStore> RemoteStore for std::sync::Arc<T> {
    fn generate_id(&self) -> TaskId {
        (**self).generate_id()
    }

    async fn set_document(&self, path: &str, task: &Task) -> Result<()> {
        (**self).set_document(path, task).await
    }

    async fn update_fields(&self, path: &str, fields: &TaskFields) -> Result<()> {
        (**self).update_fields(path, fields).await
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        (**self).delete_document(path).await
    }

    async fn subscribe(&self, path: &str) -> Result<ChangeSubscription> {
        (**self).subscribe(path).await
    }
}

/// Record of one mutating call against the store, for test assertions
/// on exactly which writes reached the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Set { path: String, task: Task },
    Update { path: String, fields: TaskFields },
    Delete { path: String },
}

struct Subscriber {
    path: String,
    tx: mpsc::UnboundedSender<SnapshotEvent>,
}

/// In-memory store for testing.
///
/// Fault injection: `fail_next(n)` makes the next `n` mutating calls
/// fail with a transient error; `deny_writes(true)` makes every
/// mutating call fail with a permanent permission error.
pub struct InMemoryStore {
    documents: RwLock<HashMap<String, Task>>,
    subscribers: Mutex<Vec<Subscriber>>,
    op_log: Mutex<Vec<StoreOp>>,
    fail_next: AtomicUsize,
    deny_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            op_log: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            deny_writes: AtomicBool::new(false),
        }
    }

    /// Make the next `n` mutating calls fail with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Toggle permanent permission failure for all mutating calls.
    pub fn deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    /// All mutating calls that reached the backend, in order.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.op_log.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.op_log.lock().unwrap().clear();
    }

    /// Read a document directly, bypassing the subscription feed.
    pub fn get_document(&self, path: &str) -> Option<Task> {
        self.documents.read().unwrap().get(path).cloned()
    }

    /// Number of documents stored under a user namespace.
    pub fn task_count(&self, owner: &UserId) -> usize {
        let prefix = format!("{}/", user_tasks_path(owner));
        self.documents
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }

    /// Deliver the current snapshot for a namespace to all matching
    /// subscribers, pruning any whose receiver was dropped.
    pub fn publish(&self, namespace: &str) {
        let snapshot = self.snapshot_of(namespace);
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|sub| {
            if sub.path != namespace {
                return true;
            }
            sub.tx
                .send(SnapshotEvent::Snapshot(snapshot.clone()))
                .is_ok()
        });
    }

    fn snapshot_of(&self, namespace: &str) -> RemoteSnapshot {
        let prefix = format!("{}/", namespace);
        let docs = self.documents.read().unwrap();
        RemoteSnapshot::from_tasks(
            docs.iter()
                .filter(|(path, _)| path.starts_with(&prefix))
                .map(|(_, task)| task.clone()),
        )
    }

    /// Namespace a document path belongs to (`tasks/{user}`).
    fn namespace_of(path: &str) -> &str {
        path.rsplit_once('/').map(|(ns, _)| ns).unwrap_or(path)
    }

    fn check_faults(&self, what: &str) -> Result<()> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(what.to_string()));
        }
        // Consume one injected failure if any remain
        let mut remaining = self.fail_next.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.fail_next.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(StoreError::Unavailable(what.to_string())),
                Err(actual) => remaining = actual,
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    fn generate_id(&self) -> TaskId {
        TaskId::new(uuid::Uuid::new_v4().simple().to_string())
    }

    async fn set_document(&self, path: &str, task: &Task) -> Result<()> {
        self.check_faults(path)?;
        self.documents
            .write()
            .unwrap()
            .insert(path.to_string(), task.clone());
        self.op_log.lock().unwrap().push(StoreOp::Set {
            path: path.to_string(),
            task: task.clone(),
        });
        self.publish(Self::namespace_of(path));
        Ok(())
    }

    async fn update_fields(&self, path: &str, fields: &TaskFields) -> Result<()> {
        self.check_faults(path)?;
        {
            let mut docs = self.documents.write().unwrap();
            let task = docs
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            fields.apply_to(task);
        }
        self.op_log.lock().unwrap().push(StoreOp::Update {
            path: path.to_string(),
            fields: fields.clone(),
        });
        self.publish(Self::namespace_of(path));
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        self.check_faults(path)?;
        // Removing a missing document is a success, matching backend
        // delete semantics
        self.documents.write().unwrap().remove(path);
        self.op_log.lock().unwrap().push(StoreOp::Delete {
            path: path.to_string(),
        });
        self.publish(Self::namespace_of(path));
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<ChangeSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Initial snapshot is delivered immediately, before any change
        let _ = tx.send(SnapshotEvent::Snapshot(self.snapshot_of(path)));
        self.subscribers.lock().unwrap().push(Subscriber {
            path: path.to_string(),
            tx,
        });
        Ok(ChangeSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> UserId {
        UserId::from("user-1")
    }

    fn task(id: &str, text: &str) -> Task {
        Task::new(TaskId::from(id), owner(), text)
    }

    #[tokio::test]
    async fn test_set_and_get_document() {
        let store = InMemoryStore::new();
        let t = task("t1", "buy milk");
        let path = task_path(&owner(), &t.id);

        store.set_document(&path, &t).await.unwrap();
        assert_eq!(store.get_document(&path), Some(t));
        assert_eq!(store.task_count(&owner()), 1);
    }

    #[tokio::test]
    async fn test_update_fields_applies_to_stored_doc() {
        let store = InMemoryStore::new();
        let t = task("t1", "buy milk");
        let path = task_path(&owner(), &t.id);
        store.set_document(&path, &t).await.unwrap();

        store
            .update_fields(&path, &TaskFields::checked(true, 2))
            .await
            .unwrap();

        let stored = store.get_document(&path).unwrap();
        assert!(stored.is_checked);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.text, "buy milk");
    }

    #[tokio::test]
    async fn test_update_missing_document_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update_fields("tasks/user-1/nope", &TaskFields::checked(true, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_delete_missing_document_succeeds() {
        let store = InMemoryStore::new();
        store.delete_document("tasks/user-1/nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_snapshot() {
        let store = InMemoryStore::new();
        let t = task("t1", "buy milk");
        store
            .set_document(&task_path(&owner(), &t.id), &t)
            .await
            .unwrap();

        let mut sub = store.subscribe(&user_tasks_path(&owner())).await.unwrap();
        match sub.try_recv() {
            Some(SnapshotEvent::Snapshot(snapshot)) => {
                assert_eq!(snapshot.len(), 1);
                assert!(snapshot.get(&TaskId::from("t1")).is_some());
            }
            other => panic!("expected initial snapshot, got {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_changes() {
        let store = InMemoryStore::new();
        let mut sub = store.subscribe(&user_tasks_path(&owner())).await.unwrap();
        // Drain the initial (empty) snapshot
        assert!(sub.try_recv().is_some());

        let t = task("t1", "buy milk");
        store
            .set_document(&task_path(&owner(), &t.id), &t)
            .await
            .unwrap();

        match sub.try_recv() {
            Some(SnapshotEvent::Snapshot(snapshot)) => assert_eq!(snapshot.len(), 1),
            _ => panic!("expected change snapshot"),
        }
    }

    #[tokio::test]
    async fn test_subscription_scoped_to_namespace() {
        let store = InMemoryStore::new();
        let other_owner = UserId::from("user-2");
        let mut sub = store.subscribe(&user_tasks_path(&owner())).await.unwrap();
        assert!(sub.try_recv().is_some());

        // A write under a different user must not be delivered
        let t = Task::new(TaskId::from("t9"), other_owner.clone(), "theirs");
        store
            .set_document(&task_path(&other_owner, &t.id), &t)
            .await
            .unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fail_next_injects_transient_errors() {
        let store = InMemoryStore::new();
        store.fail_next(2);
        let t = task("t1", "x");
        let path = task_path(&owner(), &t.id);

        let err = store.set_document(&path, &t).await.unwrap_err();
        assert!(err.is_transient());
        let err = store.set_document(&path, &t).await.unwrap_err();
        assert!(err.is_transient());

        // Third attempt goes through
        store.set_document(&path, &t).await.unwrap();
        assert_eq!(store.ops().len(), 1);
    }

    #[tokio::test]
    async fn test_deny_writes_is_permanent() {
        let store = InMemoryStore::new();
        store.deny_writes(true);
        let t = task("t1", "x");

        let err = store
            .set_document(&task_path(&owner(), &t.id), &t)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_retry_classification() {
        assert!(StoreError::Unavailable("x".into()).is_transient());
        assert!(StoreError::Timeout("x".into()).is_transient());
        assert!(StoreError::Other("x".into()).is_transient());

        assert!(!StoreError::PermissionDenied("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::Corrupt("x".into()).is_transient());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let store = InMemoryStore::new();
        let a = store.generate_id();
        let b = store.generate_id();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_path_convention() {
        assert_eq!(user_tasks_path(&owner()), "tasks/user-1");
        assert_eq!(
            task_path(&owner(), &TaskId::from("abc")),
            "tasks/user-1/abc"
        );
    }
}
