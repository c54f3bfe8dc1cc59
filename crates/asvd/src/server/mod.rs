//! HTTP query server for the ASV daemon.
//!
//! The server:
//! - Serves read-only JSON queries over the session store
//! - Streams live session updates over SSE
//! - Bounds every query route by the write timeout
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    ApiServer    │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ route
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   dispatcher    │────▶│    handlers     │──▶ SessionStore
//! │ bounded/stream  │     │   watch (SSE)   │──▶ NotificationBus
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the crate's panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Handler failures become JSON error responses, never task panics

mod dispatch;
mod error;
mod handlers;
mod watch;

pub use error::{ApiError, REQUEST_TIMED_OUT};
pub use handlers::{
    MessagesQuery, SearchQuery, SessionQuery, DEFAULT_MESSAGE_LIMIT, DEFAULT_SEARCH_LIMIT,
    DEFAULT_SESSION_LIMIT, MAX_MESSAGE_LIMIT, MAX_SEARCH_LIMIT, MAX_SESSION_LIMIT,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use asv_protocol::API_PREFIX;

use crate::bus::NotificationBus;
use crate::store::SessionStore;

/// Interval between SSE keep-alive comments.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Extra time the dispatcher gives a handler past its deadline before
/// answering 503 on its behalf.
pub const DEFAULT_GUARD_GRACE: Duration = Duration::from_secs(1);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub bus: NotificationBus,
    pub write_timeout: Duration,
    /// Cancelled when the daemon shuts down; every request deadline and
    /// watch stream is derived from it.
    pub shutdown: CancellationToken,
    pub keep_alive: Duration,
    pub guard_grace: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SessionStore>,
        bus: NotificationBus,
        write_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            bus,
            write_timeout,
            shutdown,
            keep_alive: DEFAULT_KEEP_ALIVE,
            guard_grace: DEFAULT_GUARD_GRACE,
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    pub fn with_guard_grace(mut self, grace: Duration) -> Self {
        self.guard_grace = grace;
        self
    }
}

/// Builds the API router.
///
/// Query routes go through the bounded dispatcher; the watch route only has
/// its setup bounded.
pub fn router(state: AppState) -> Router {
    let bounded = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/messages", get(handlers::get_messages))
        .route("/sessions/{id}/minimap", get(handlers::get_minimap))
        .route("/stats", get(handlers::get_stats))
        .route("/projects", get(handlers::list_projects))
        .route("/machines", get(handlers::list_machines))
        .route("/search", get(handlers::search))
        .route("/health", get(handlers::health))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            dispatch::bounded,
        ));

    let streaming = Router::new()
        .route("/sessions/{id}/watch", get(watch::watch_session))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            dispatch::streaming,
        ));

    Router::new()
        .nest(API_PREFIX, bounded.merge(streaming))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError::NotFound("not found".to_string())
}

// ============================================================================
// Server
// ============================================================================

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// HTTP server bound to a TCP address.
pub struct ApiServer {
    listener: TcpListener,
    state: AppState,
}

impl ApiServer {
    /// Binds the listener. Port 0 picks a free port.
    pub async fn bind(addr: &str, state: AppState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Serve)
    }

    /// Serves until `cancel` fires, then drains open connections.
    ///
    /// Watch streams end on the state's shutdown token, which should be
    /// `cancel` or one of its parents.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "API server listening");
        }

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(ServerError::Serve)?;

        info!("API server stopped");
        Ok(())
    }
}
