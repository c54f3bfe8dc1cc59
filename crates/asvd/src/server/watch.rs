//! Live session updates over Server-Sent Events.
//!
//! The stream opens with a `snapshot` event carrying the session as stored,
//! then one `session_updated` event per applied tail batch. It is exempt
//! from the write timeout: only the subscribe-and-snapshot step is bounded.
//! The stream ends when the client disconnects or the daemon shuts down.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use asv_core::SessionId;
use asv_protocol::{EVENT_SESSION_UPDATED, EVENT_SNAPSHOT};

use super::error::ApiError;
use super::AppState;
use crate::bus::Subscription;
use crate::deadline::Deadline;

/// `GET /sessions/{id}/watch`
pub async fn watch_session(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = SessionId::new(id);

    // Subscribe before reading the snapshot so no update falls in between.
    let subscription = state.bus.subscribe(id.clone());
    deadline.check()?;
    let session = state
        .store
        .get_session(&id, &deadline)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))?;

    debug!(session_id = %id, "Watch stream opened");

    let snapshot = stream::once(async move { Ok(sse_event(EVENT_SNAPSHOT, &session)) });
    let updates = change_stream(subscription, state.shutdown.clone());

    Ok(Sse::new(snapshot.chain(updates)).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

fn change_stream(
    subscription: Subscription,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((subscription, shutdown), |(mut sub, shutdown)| async move {
        let event = tokio::select! {
            _ = shutdown.cancelled() => None,
            event = sub.recv() => event,
        };
        match event {
            Some(event) => Some((Ok(sse_event(EVENT_SESSION_UPDATED, &event)), (sub, shutdown))),
            None => {
                debug!(session_id = %sub.session_id(), "Watch stream closed");
                None
            }
        }
    })
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().event(name).data(data),
        Err(e) => {
            warn!(event = name, error = %e, "Failed to encode watch event");
            Event::default().event(name).data("{}")
        }
    }
}
