//! Change-notification infrastructure for repository observers.
//!
//! The presentation layer subscribes to `TaskEvent`s instead of holding
//! mutable list state of its own: after every mutation and every
//! reconciliation the repository publishes the full current task set.

use crate::task::{Task, TaskId};

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the repository for UI/monitoring consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskEvent {
    /// The task set changed (mutation or reconciliation). Carries the
    /// full current set; order is not meaningful.
    ListChanged { tasks: Vec<Task> },
    /// Queued remote writes for this task keep failing; local state is
    /// kept and the user may retry or discard explicitly.
    SyncFailed { id: TaskId },
    /// The backend rejected a write for this task with an
    /// authorization failure. Not retried.
    PermissionDenied { id: TaskId },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving
/// events, drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing task events to subscribers.
///
/// Thread-safe for use in a multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(TaskEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on
    /// drop. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(TaskEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write avoids deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit)
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: TaskEvent) {
        // Clone the callback list so a callback may itself subscribe
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::UserId;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn list_changed() -> TaskEvent {
        TaskEvent::ListChanged { tasks: vec![] }
    }

    #[test]
    fn test_events_carry_their_payload_to_subscribers() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            if let TaskEvent::SyncFailed { id } = event {
                seen_clone.lock().unwrap().push(id);
            }
        });

        bus.emit(list_changed());
        bus.emit(TaskEvent::SyncFailed {
            id: TaskId::from("t1"),
        });
        bus.emit(TaskEvent::SyncFailed {
            id: TaskId::from("t2"),
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TaskId::from("t1"), TaskId::from("t2")]
        );
    }

    #[test]
    fn test_dropping_one_subscription_keeps_the_other() {
        let bus = Arc::new(EventBus::new());
        let kept = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        let kept_clone = Arc::clone(&kept);
        let _kept_sub = bus.subscribe(move |_| {
            kept_clone.fetch_add(1, Ordering::Relaxed);
        });

        {
            let dropped_clone = Arc::clone(&dropped);
            let _short_lived = bus.subscribe(move |_| {
                dropped_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(list_changed());
        }
        bus.emit(list_changed());

        assert_eq!(kept.load(Ordering::Relaxed), 2);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscribe_from_within_a_callback() {
        let bus = Arc::new(EventBus::new());
        let late_count = Arc::new(AtomicUsize::new(0));
        // The inner subscription must be kept alive outside the callback
        let held: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let bus_clone = Arc::clone(&bus);
        let late_clone = Arc::clone(&late_count);
        let held_clone = Arc::clone(&held);
        let _sub = bus.subscribe(move |_| {
            let mut held = held_clone.lock().unwrap();
            if held.is_none() {
                let late = Arc::clone(&late_clone);
                *held = Some(bus_clone.subscribe(move |_| {
                    late.fetch_add(1, Ordering::Relaxed);
                }));
            }
        });

        // Registering during delivery must not deadlock; the late
        // subscriber only sees events emitted after it joined
        bus.emit(list_changed());
        assert_eq!(late_count.load(Ordering::Relaxed), 0);

        bus.emit(list_changed());
        assert_eq!(late_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = TaskEvent::ListChanged {
            tasks: vec![Task::new(TaskId::from("t1"), UserId::from("u1"), "x")],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"listChanged\""));
        assert!(json.contains("\"ownerId\":\"u1\""));

        let event = TaskEvent::SyncFailed {
            id: TaskId::from("t1"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"syncFailed\""));
        assert!(json.contains("\"id\":\"t1\""));
    }
}
