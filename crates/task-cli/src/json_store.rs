//! RemoteStore backed by a JSON file.
//!
//! Stands in for a hosted document store so the CLI is usable without
//! a backend: the whole document map is kept in one JSON file, read
//! before and rewritten after every mutation. Writes go through a
//! temp-file rename so a crash never leaves a half-written store.
//!
//! Change subscriptions work the same way as against a real backend:
//! subscribers get the current snapshot immediately and a fresh one
//! after every write that goes through this store instance. Writes by
//! other processes are picked up on the next load.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use task_store::store::{Result, user_tasks_path};
use task_store::{
    ChangeSubscription, RemoteSnapshot, RemoteStore, SnapshotEvent, StoreError, Task, TaskFields,
    TaskId, UserId,
};

struct Subscriber {
    namespace: String,
    tx: mpsc::UnboundedSender<SnapshotEvent>,
}

/// File-backed task document store.
pub struct JsonFileStore {
    path: PathBuf,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored task set for one user, read directly from disk.
    pub async fn snapshot_for(&self, owner: &UserId) -> Result<RemoteSnapshot> {
        let docs = self.load().await?;
        Ok(Self::snapshot_of(&docs, &user_tasks_path(owner)))
    }

    async fn load(&self) -> Result<HashMap<String, Task>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("store file {}: {e}", self.path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }

    async fn save(&self, docs: &HashMap<String, Task>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        let contents = serde_json::to_vec_pretty(docs)
            .map_err(|e| StoreError::Other(e.to_string()))?;

        // Write-then-rename keeps the store file whole under a crash
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn snapshot_of(docs: &HashMap<String, Task>, namespace: &str) -> RemoteSnapshot {
        let prefix = format!("{}/", namespace);
        RemoteSnapshot::from_tasks(
            docs.iter()
                .filter(|(path, _)| path.starts_with(&prefix))
                .map(|(_, task)| task.clone()),
        )
    }

    fn namespace_of(path: &str) -> &str {
        path.rsplit_once('/').map(|(ns, _)| ns).unwrap_or(path)
    }

    fn publish(&self, docs: &HashMap<String, Task>, namespace: &str) {
        let snapshot = Self::snapshot_of(docs, namespace);
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|sub| {
            if sub.namespace != namespace {
                return true;
            }
            sub.tx
                .send(SnapshotEvent::Snapshot(snapshot.clone()))
                .is_ok()
        });
    }
}

#[async_trait]
impl RemoteStore for JsonFileStore {
    fn generate_id(&self) -> TaskId {
        TaskId::new(uuid::Uuid::new_v4().simple().to_string())
    }

    async fn set_document(&self, path: &str, task: &Task) -> Result<()> {
        let mut docs = self.load().await?;
        docs.insert(path.to_string(), task.clone());
        self.save(&docs).await?;
        debug!(%path, "wrote document");
        self.publish(&docs, Self::namespace_of(path));
        Ok(())
    }

    async fn update_fields(&self, path: &str, fields: &TaskFields) -> Result<()> {
        let mut docs = self.load().await?;
        let task = docs
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        fields.apply_to(task);
        self.save(&docs).await?;
        debug!(%path, "updated document fields");
        self.publish(&docs, Self::namespace_of(path));
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        let mut docs = self.load().await?;
        if docs.remove(path).is_none() {
            // Deleting a missing document is fine
            return Ok(());
        }
        self.save(&docs).await?;
        debug!(%path, "deleted document");
        self.publish(&docs, Self::namespace_of(path));
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<ChangeSubscription> {
        let docs = self.load().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SnapshotEvent::Snapshot(Self::snapshot_of(&docs, path)));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                namespace: path.to_string(),
                tx,
            });
        Ok(ChangeSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_store::store::task_path;

    fn owner() -> UserId {
        UserId::from("user-1")
    }

    fn task(id: &str, text: &str) -> Task {
        Task::new(TaskId::from(id), owner(), text)
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("tasks.json"));
        let snapshot = store.snapshot_for(&owner()).await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let t = task("t1", "buy milk");
        {
            let store = JsonFileStore::new(&path);
            store
                .set_document(&task_path(&owner(), &t.id), &t)
                .await
                .unwrap();
        }

        let store = JsonFileStore::new(&path);
        let snapshot = store.snapshot_for(&owner()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&t.id).unwrap().text, "buy milk");
    }

    #[tokio::test]
    async fn test_update_and_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("tasks.json"));
        let t = task("t1", "buy milk");
        let doc_path = task_path(&owner(), &t.id);

        store.set_document(&doc_path, &t).await.unwrap();
        store
            .update_fields(&doc_path, &TaskFields::checked(true, 2))
            .await
            .unwrap();

        let snapshot = store.snapshot_for(&owner()).await.unwrap();
        let stored = snapshot.get(&t.id).unwrap();
        assert!(stored.is_checked);
        assert_eq!(stored.version, 2);

        store.delete_document(&doc_path).await.unwrap();
        assert!(store.snapshot_for(&owner()).await.unwrap().is_empty());
        // Deleting again still succeeds
        store.delete_document(&doc_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_document_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("tasks.json"));
        let err = store
            .update_fields("tasks/user-1/nope", &TaskFields::text("x", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_subscription_sees_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("tasks.json"));

        let mut sub = store.subscribe(&user_tasks_path(&owner())).await.unwrap();
        match sub.recv().await {
            Some(SnapshotEvent::Snapshot(s)) => assert!(s.is_empty()),
            _ => panic!("expected initial snapshot"),
        }

        let t = task("t1", "buy milk");
        store
            .set_document(&task_path(&owner(), &t.id), &t)
            .await
            .unwrap();
        match sub.recv().await {
            Some(SnapshotEvent::Snapshot(s)) => assert_eq!(s.len(), 1),
            _ => panic!("expected change snapshot"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_permanent_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = JsonFileStore::new(&path);
        let err = store.snapshot_for(&owner()).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        // A broken file never resolves on its own, so no retry loop
        assert!(!err.is_transient());
    }
}
