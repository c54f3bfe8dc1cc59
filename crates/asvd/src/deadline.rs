//! Cancellable deadline tokens.
//!
//! A `Deadline` couples an optional expiry instant with a cancellation
//! token. It is created once per request by the dispatcher and threaded
//! explicitly through the query layer into every storage call, so a single
//! expiry (or a client disconnect, or shutdown) stops all work done on the
//! request's behalf.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeadlineError {
    /// The expiry instant passed.
    #[error("deadline exceeded")]
    Exceeded,

    /// The token was cancelled (client went away or the process is stopping).
    #[error("operation cancelled")]
    Cancelled,
}

/// Expiry instant plus cancellation signal, whichever fires first.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancel: CancellationToken,
}

impl Deadline {
    /// Creates a deadline bound to `cancel` that expires after `timeout`.
    ///
    /// `None` means the deadline only fires through cancellation.
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            expires_at: timeout.map(|t| Instant::now() + t),
            cancel,
        }
    }

    /// Deadline expiring after `timeout` with its own cancellation token.
    pub fn after(timeout: Duration) -> Self {
        Self::new(CancellationToken::new(), Some(timeout))
    }

    /// Deadline that never expires and only fires when `cancel` is cancelled.
    pub fn until_cancelled(cancel: CancellationToken) -> Self {
        Self::new(cancel, None)
    }

    /// Deadline that has already expired.
    pub fn expired() -> Self {
        Self {
            expires_at: Some(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the cancellation token backing this deadline.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before expiry, `None` when there is no expiry instant.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Returns the reason the deadline has fired, if it has.
    pub fn state(&self) -> Option<DeadlineError> {
        if self.expires_at.is_some_and(|at| Instant::now() >= at) {
            Some(DeadlineError::Exceeded)
        } else if self.cancel.is_cancelled() {
            Some(DeadlineError::Cancelled)
        } else {
            None
        }
    }

    /// Returns true once the deadline has fired.
    pub fn is_done(&self) -> bool {
        self.state().is_some()
    }

    /// Fails fast if the deadline has fired.
    pub fn check(&self) -> Result<(), DeadlineError> {
        match self.state() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Resolves when the deadline fires, yielding the reason.
    pub async fn done(&self) -> DeadlineError {
        match self.expires_at {
            Some(at) => tokio::select! {
                _ = tokio::time::sleep_until(at) => DeadlineError::Exceeded,
                _ = self.cancel.cancelled() => DeadlineError::Cancelled,
            },
            None => {
                self.cancel.cancelled().await;
                DeadlineError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_deadline_fails_check() {
        let deadline = Deadline::expired();
        assert_eq!(deadline.check(), Err(DeadlineError::Exceeded));
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_fresh_deadline_passes_check() {
        let deadline = Deadline::after(Duration::from_secs(30));
        assert!(deadline.check().is_ok());
        assert!(deadline.remaining().unwrap() > Duration::from_secs(29));
    }

    #[tokio::test]
    async fn test_cancellation_fires_deadline() {
        let token = CancellationToken::new();
        let deadline = Deadline::until_cancelled(token.clone());
        assert!(deadline.remaining().is_none());
        assert!(!deadline.is_done());

        token.cancel();
        assert_eq!(deadline.check(), Err(DeadlineError::Cancelled));
        assert_eq!(deadline.done().await, DeadlineError::Cancelled);
    }

    #[tokio::test]
    async fn test_child_token_follows_parent() {
        let root = CancellationToken::new();
        let deadline = Deadline::new(root.child_token(), Some(Duration::from_secs(30)));
        root.cancel();
        assert_eq!(deadline.check(), Err(DeadlineError::Cancelled));
    }

    #[tokio::test]
    async fn test_done_resolves_on_expiry() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let reason = tokio::time::timeout(Duration::from_secs(2), deadline.done())
            .await
            .expect("deadline should fire");
        assert_eq!(reason, DeadlineError::Exceeded);
    }
}
