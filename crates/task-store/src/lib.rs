//! task-store: Local-first synchronized task store.
//!
//! This crate provides the core for a to-do application that keeps a
//! per-user task set consistent with a remote document store:
//! - A `Task` document model with per-record versions
//! - A `RemoteStore` trait abstraction over the persistence backend
//! - A `TaskRepository` that applies optimistic local mutations and
//!   reconciles remote snapshots
//! - A `SyncEngine` that flushes queued mutations with retry/backoff

pub mod backoff;
pub mod engine;
pub mod events;
pub mod queue;
pub mod repository;
pub mod store;
pub mod task;

pub use backoff::RetryConfig;
pub use engine::{EngineConfig, FlushOutcome, FlushReport, SyncEngine};
pub use events::{EventBus, Subscription, TaskEvent};
pub use queue::{Mutation, MutationQueue, OpState, QueuedOp};
pub use repository::{RepositoryError, TaskRepository};
pub use store::{
    ChangeSubscription, InMemoryStore, RemoteSnapshot, RemoteStore, SnapshotEvent, StoreError,
};
pub use task::{Task, TaskFields, TaskId, UserId};
