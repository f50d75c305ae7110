//! Harvest events for monitoring.
//!
//! Provides `HarvestEvent` and `EventBus` for subscriptions. The coordinator
//! and discovery emit onto a shared `Arc<EventBus>`; the daemon subscribes to
//! log progress.

use crate::endpoint::Endpoint;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted while harvesting and discovering.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HarvestEvent {
    /// A replication pass began.
    PassStarted {
        endpoint: Endpoint,
        #[serde(rename = "runId")]
        run_id: String,
    },
    /// One page was imported and committed.
    BatchImported {
        endpoint: Endpoint,
        /// Records ingested successfully from this page.
        imported: usize,
        /// Records that failed to ingest from this page.
        failed: usize,
    },
    /// A pass finished and the watermark advanced.
    PassCompleted {
        endpoint: Endpoint,
        imported: usize,
        /// Records still listed in `failed_imports`.
        #[serde(rename = "remainingFailures")]
        remaining_failures: usize,
    },
    /// A pass stopped early.
    PassFailed { endpoint: Endpoint, reason: String },
    /// A new peer was added from a friends list.
    NodeDiscovered {
        endpoint: Endpoint,
        via: Endpoint,
        distance: u32,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
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

type Callback = Arc<dyn Fn(HarvestEvent) + Send + Sync>;

/// Event bus for publishing harvest events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(HarvestEvent) + Send + Sync + 'static,
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
        // emit releases the lock before running callbacks, so this cannot
        // be waiting on ourselves.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: HarvestEvent) {
        // Clone the list so a callback may subscribe without deadlocking.
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
    use std::sync::Mutex;

    fn endpoint() -> Endpoint {
        "http://a.example.org/oai".parse().unwrap()
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        bus.emit(HarvestEvent::PassFailed {
            endpoint: endpoint(),
            reason: "down".into(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], HarvestEvent::PassFailed { .. }));
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(HarvestEvent::PassFailed {
            endpoint: endpoint(),
            reason: "a".into(),
        });
        drop(sub);
        bus.emit(HarvestEvent::PassFailed {
            endpoint: endpoint(),
            reason: "b".into(),
        });

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_waits_for_a_busy_bus() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        // Another thread drops the subscription while the list is locked.
        let guard = bus.callbacks.read().unwrap();
        let dropper = std::thread::spawn(move || drop(sub));
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(guard);
        dropper.join().unwrap();

        bus.emit(HarvestEvent::PassFailed {
            endpoint: endpoint(),
            reason: "late".into(),
        });
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = HarvestEvent::PassCompleted {
            endpoint: endpoint(),
            imported: 3,
            remaining_failures: 1,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"passCompleted\""));
        assert!(json.contains("\"endpoint\":\"http://a.example.org/oai\""));
        assert!(json.contains("\"remainingFailures\":1"));
    }
}
