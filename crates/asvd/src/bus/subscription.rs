//! Receiving side of a bus registration.

use std::sync::Weak;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use asv_core::SessionId;
use asv_protocol::ChangeEvent;

use super::BusInner;

/// One watcher's registration for one session.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    session_id: SessionId,
    rx: Option<broadcast::Receiver<ChangeEvent>>,
    bus: Weak<BusInner>,
    /// Total events dropped because this subscriber fell behind
    missed: u64,
    /// Set between a drop and the next delivered event
    gap: bool,
}

impl Subscription {
    pub(crate) fn new(
        session_id: SessionId,
        rx: broadcast::Receiver<ChangeEvent>,
        bus: Weak<BusInner>,
    ) -> Self {
        Self {
            session_id,
            rx: Some(rx),
            bus,
            missed: 0,
            gap: false,
        }
    }

    pub(crate) fn closed(session_id: SessionId) -> Self {
        Self {
            session_id,
            rx: None,
            bus: Weak::new(),
            missed: 0,
            gap: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Events dropped for this subscriber so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once unsubscribed or when the bus shuts down.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(mut event) => {
                    if std::mem::take(&mut self.gap) {
                        event.missed_updates = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %self.session_id,
                        skipped,
                        "Watch subscriber lagged, dropped events"
                    );
                    self.missed = self.missed.saturating_add(skipped);
                    self.gap = true;
                }
                Err(RecvError::Closed) => {
                    debug!(session_id = %self.session_id, "Watch channel closed");
                    self.unsubscribe();
                    return None;
                }
            }
        }
    }

    /// Removes this registration. Safe to call repeatedly or after the bus
    /// has shut down.
    pub fn unsubscribe(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        drop(rx);
        if let Some(bus) = self.bus.upgrade() {
            bus.release(&self.session_id);
        }
        debug!(session_id = %self.session_id, "Watch subscriber removed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
