//! User-facing notifications.
//!
//! The engine never prints; it emits `SyncEvent`s on an `EventBus`. A host
//! (the daemon, a UI) subscribes and renders them as transient notices.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Notifications emitted while syncing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A reconciliation pass found files missing locally.
    DownloadStarted { total: usize },
    /// One file of a download batch was materialized.
    Downloaded {
        path: String,
        index: usize,
        total: usize,
    },
    /// The download batch finished.
    DownloadComplete { total: usize },
    /// A new file was pushed to the remote store.
    Uploaded { path: String },
    /// An attachment was renamed locally before upload; links must be fixed.
    AttachmentRenamed {
        from: String,
        to: String,
        /// New file name, for the user to update links with
        #[serde(rename = "fileName")]
        file_name: String,
    },
    /// A tracked file's edits were pushed.
    Pushed { path: String },
    /// Local content was replaced by the remote copy.
    Pulled { path: String },
    /// A file or folder was renamed remotely.
    Renamed { from: String, to: String },
    /// A remote file was actually deleted.
    Deleted { path: String },
    /// A local orphan was removed because it vanished remotely.
    OrphanRemoved { path: String },
    /// The requested file has no remote copy yet.
    NotOnRemote { path: String },
    /// Bulk operation progress ("Creating vault...", "Clearing vault...")
    Progress { message: String },
    /// An operation failed; the user should know.
    Failed {
        operation: String,
        path: Option<String>,
        message: String,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
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

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing notifications to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
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

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
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
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the callback list so a callback may subscribe without deadlocking.
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

/// Collects every event, for assertions in tests.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<std::sync::Mutex<Vec<SyncEvent>>>,
}

impl EventLog {
    /// Subscribe a new log to `bus`. Keep the returned subscription alive.
    pub fn attach(bus: &Arc<EventBus>) -> (Self, Subscription) {
        let log = Self::default();
        let sink = log.clone();
        let sub = bus.subscribe(move |event| {
            sink.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        });
        (log, sub)
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploaded(path: &str) -> SyncEvent {
        SyncEvent::Uploaded { path: path.into() }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(uploaded("test.md"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let (log, sub) = EventLog::attach(&bus);

        bus.emit(uploaded("a.md"));
        drop(sub);
        bus.emit(uploaded("b.md"));

        assert_eq!(log.events(), vec![uploaded("a.md")]);
    }

    #[test]
    fn test_sync_event_serialization() {
        let event = SyncEvent::AttachmentRenamed {
            from: "img/photo.png".into(),
            to: "img/photo-synced.png".into(),
            file_name: "photo-synced.png".into(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"attachmentRenamed\""));
        assert!(json.contains("\"fileName\":\"photo-synced.png\""));
    }
}
