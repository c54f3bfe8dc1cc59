//! Deadline dispatcher.
//!
//! Routes are classified when the router is built:
//!
//! - **bounded** routes get a [`Deadline`] of `write_timeout`, tied to
//!   process shutdown and to the request future itself (a client that goes
//!   away drops the future, which cancels the token). The handler and every
//!   store call it makes honour that deadline and answer 504. As a backstop
//!   the dispatcher stops waiting at `write_timeout + guard_grace` and
//!   answers 503 `{"error":"request timed out"}`.
//! - **streaming** routes get the same deadline for their setup only. The
//!   response itself is never timed out; it ends on disconnect or shutdown.

use std::convert::Infallible;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error::ApiError;
use super::AppState;
use crate::deadline::Deadline;

/// Middleware for routes subject to the write timeout.
pub async fn bounded(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let cancel = state.shutdown.child_token();
    // Dropped with this future, including on client disconnect.
    let _disconnect = cancel.clone().drop_guard();

    req.extensions_mut()
        .insert(Deadline::new(cancel, Some(state.write_timeout)));

    let path = req.uri().path().to_string();
    let budget = state.write_timeout.saturating_add(state.guard_grace);
    match tokio::time::timeout(budget, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(
                path = %path,
                budget_ms = budget.as_millis() as u64,
                "Handler ignored its deadline, request timed out"
            );
            ApiError::RequestTimedOut.into_response()
        }
    }
}

/// Middleware for long-lived streaming routes.
pub async fn streaming(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    req.extensions_mut().insert(Deadline::new(
        state.shutdown.child_token(),
        Some(state.write_timeout),
    ));
    next.run(req).await
}

/// Handlers take their deadline as an extractor. A route mounted without a
/// dispatcher middleware gets a deadline that never expires.
impl<S> FromRequestParts<S> for Deadline
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Deadline>()
            .cloned()
            .unwrap_or_else(|| Deadline::until_cancelled(CancellationToken::new())))
    }
}
