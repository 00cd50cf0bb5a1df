//! Task document model.
//!
//! A `Task` is the unit of storage: one document per task under the
//! owning user's namespace. `version` increases with every local
//! mutation and travels with every write, so reconciliation can pick a
//! deterministic winner when local and remote copies diverge.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Opaque unique identifier for a task, assigned at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable identifier of the owning user, supplied by the identity
/// collaborator. Tasks are only ever visible to their owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single to-do item.
///
/// Persisted fields use camelCase names on the wire (`text`,
/// `isChecked`, `ownerId`, `version`). `sync_failed` is local-only
/// state surfaced to observers and never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub owner_id: UserId,
    pub text: String,
    pub is_checked: bool,
    /// Monotonically increasing per-record version, bumped on every
    /// local mutation. Reconciliation keeps the higher version; ties
    /// favor the remote copy.
    pub version: u64,
    /// Set when queued remote writes for this task keep failing.
    /// Cleared on the next successful send. Never rolled into the
    /// durable copy.
    #[serde(skip)]
    pub sync_failed: bool,
}

impl Task {
    /// Create a fresh unchecked task at version 1.
    pub fn new(id: TaskId, owner_id: UserId, text: impl Into<String>) -> Self {
        Self {
            id,
            owner_id,
            text: text.into(),
            is_checked: false,
            version: 1,
            sync_failed: false,
        }
    }

    /// Compare persisted content, ignoring the local `sync_failed` flag.
    pub fn same_content(&self, other: &Task) -> bool {
        self.id == other.id
            && self.owner_id == other.owner_id
            && self.text == other.text
            && self.is_checked == other.is_checked
            && self.version == other.version
    }
}

/// Partial field update for a task document.
///
/// Only the set fields are written. Queued updates for the same task
/// are coalesced field-wise: the latest pending value per field wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_checked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl TaskFields {
    /// Field update for a text edit.
    pub fn text(text: impl Into<String>, version: u64) -> Self {
        Self {
            text: Some(text.into()),
            is_checked: None,
            version: Some(version),
        }
    }

    /// Field update for a completion toggle.
    pub fn checked(is_checked: bool, version: u64) -> Self {
        Self {
            text: None,
            is_checked: Some(is_checked),
            version: Some(version),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.is_checked.is_none() && self.version.is_none()
    }

    /// Overlay `newer` onto self; fields set in `newer` win.
    pub fn merge(&mut self, newer: &TaskFields) {
        if let Some(text) = &newer.text {
            self.text = Some(text.clone());
        }
        if let Some(is_checked) = newer.is_checked {
            self.is_checked = Some(is_checked);
        }
        if let Some(version) = newer.version {
            self.version = Some(version);
        }
    }

    /// Apply the set fields to a task in place.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(text) = &self.text {
            task.text = text.clone();
        }
        if let Some(is_checked) = self.is_checked {
            task.is_checked = is_checked;
        }
        if let Some(version) = self.version {
            task.version = version;
        }
    }
}
