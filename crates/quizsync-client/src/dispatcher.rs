//! In-process publish/subscribe registry for session events.
//!
//! Subscribers register a callback under an event name and receive every
//! event of that name in registration order. [`ANY`] subscribes to every
//! event; wildcard subscribers run after the named ones.
//!
//! Delivery snapshots the subscriber list before invoking anything, so a
//! callback may subscribe or unsubscribe (itself included) without
//! affecting the pass in progress. A panicking callback is logged and
//! skipped; the remaining subscribers still receive the event.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use quizsync_core::ids::SubscriptionId;
use quizsync_core::protocol::SessionEvent;
use tracing::{error, trace};

/// Event name that matches every event.
pub const ANY: &str = "*";

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

/// Ordered multi-subscriber event registry.
pub struct EventDispatcher {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for `event`. Returns the handle for [`off`](Self::off).
    pub fn on<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .entry(event.to_owned())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        trace!(event, subscription = %id, "subscribed");
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock();
        let Some(list) = subs.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            let _ = subs.remove(event);
        }
        removed
    }

    /// Remove every subscription for `event`.
    pub fn off_all(&self, event: &str) {
        let _ = self.subscribers.lock().remove(event);
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    /// Total number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }

    /// Number of callbacks registered for `event` (wildcards excluded).
    pub fn subscriber_count_for(&self, event: &str) -> usize {
        self.subscribers.lock().get(event).map_or(0, Vec::len)
    }

    /// Deliver `event` to its subscribers, then to wildcard subscribers.
    ///
    /// Returns the number of callbacks that ran to completion.
    pub fn emit(&self, event: &SessionEvent) -> usize {
        let targets: Vec<(SubscriptionId, Callback)> = {
            let subs = self.subscribers.lock();
            let named = subs.get(&event.event_type).into_iter().flatten();
            let wildcard = if event.event_type == ANY {
                None
            } else {
                subs.get(ANY)
            };
            named
                .chain(wildcard.into_iter().flatten())
                .map(|s| (s.id, Arc::clone(&s.callback)))
                .collect()
        };

        let mut delivered = 0;
        for (id, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                    error!(event = %event.event_type, subscription = %id, panic = %msg, "subscriber panicked");
                }
            }
        }
        delivered
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
