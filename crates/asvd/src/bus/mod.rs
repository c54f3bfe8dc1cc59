//! In-process notification bus keyed by session id.
//!
//! The tailer publishes one [`ChangeEvent`] per session per tail cycle;
//! watch streams subscribe to the sessions they display. Each session gets
//! its own bounded broadcast channel, created on first subscribe and
//! removed when its last subscriber leaves.
//!
//! Delivery is best-effort. A subscriber that falls behind loses the oldest
//! buffered events; its next event carries `missed_updates = true` so the
//! viewer re-fetches full state instead of trusting a diff.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned registry lock is recovered, never propagated
//! - Unsubscribing after shutdown, or twice, is a no-op

mod subscription;

pub use subscription::Subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use asv_core::SessionId;
use asv_protocol::ChangeEvent;

/// Default per-subscriber buffer, in events.
pub const DEFAULT_WATCH_BUFFER: usize = 64;

/// Publish/subscribe registry for session change events.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    channels: Mutex<HashMap<SessionId, broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl BusInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<SessionId, broadcast::Sender<ChangeEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the channel for `session_id` once nobody listens to it.
    pub(crate) fn release(&self, session_id: &SessionId) {
        let mut channels = self.channels();
        let idle = channels
            .get(session_id)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            channels.remove(session_id);
            trace!(session_id = %session_id, "Released idle watch channel");
        }
    }
}

impl NotificationBus {
    /// Creates a bus whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Registers interest in `session_id`.
    ///
    /// After [`shutdown`](Self::shutdown) the returned subscription is
    /// already closed.
    pub fn subscribe(&self, session_id: SessionId) -> Subscription {
        if self.inner.closed.load(Ordering::Acquire) {
            return Subscription::closed(session_id);
        }

        let rx = {
            let mut channels = self.inner.channels();
            channels
                .entry(session_id.clone())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        debug!(session_id = %session_id, "Watch subscriber added");

        Subscription::new(session_id, rx, Arc::downgrade(&self.inner))
    }

    /// Delivers `event` to every current subscriber of its session.
    ///
    /// Returns the number of subscribers reached; zero (a no-op) when the
    /// session has none.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut channels = self.inner.channels();
        let Some(sender) = channels.get(&event.session_id) else {
            return 0;
        };

        let session_id = event.session_id.clone();
        match sender.send(event) {
            Ok(reached) => {
                trace!(session_id = %session_id, reached, "Published change event");
                reached
            }
            Err(_) => {
                // Every receiver is gone.
                channels.remove(&session_id);
                0
            }
        }
    }

    /// Returns the number of live subscribers for `session_id`.
    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.inner
            .channels()
            .get(session_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Returns the number of sessions with at least one subscriber channel.
    pub fn watched_sessions(&self) -> usize {
        self.inner.channels().len()
    }

    /// Closes every subscription and refuses new ones.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let dropped = {
            let mut channels = self.inner.channels();
            let count = channels.len();
            channels.clear();
            count
        };
        debug!(channels = dropped, "Notification bus shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_BUFFER)
    }
}
