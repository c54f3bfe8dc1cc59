//! HTTP wire types exchanged between the daemon and viewers.

use asv_core::{Message, Session, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Path prefix for every API route.
pub const API_PREFIX: &str = "/api/v1";

/// SSE event name for the initial session state on a watch stream.
pub const EVENT_SNAPSHOT: &str = "snapshot";

/// SSE event name for a change notification on a watch stream.
pub const EVENT_SESSION_UPDATED: &str = "session_updated";

/// Error envelope returned on every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Notification that a session's derived state changed.
///
/// Coalesced: one event per session per tail cycle, however many records
/// that cycle applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub session_id: SessionId,
    pub message_count: u64,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when earlier events for this subscriber were dropped; the viewer
    /// should re-fetch full state instead of applying a diff.
    #[serde(default)]
    pub missed_updates: bool,
}

impl ChangeEvent {
    /// Builds the event describing the current state of `session`.
    pub fn for_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            message_count: session.message_count,
            ended_at: session.ended_at,
            missed_updates: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
    /// Number of matching sessions before `limit` was applied
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub session_id: SessionId,
    pub messages: Vec<Message>,
}

/// Compact per-message entry for the session overview strip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimapEntry {
    pub ordinal: u64,
    pub role: String,
    pub length: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimapResponse {
    pub session_id: SessionId,
    pub entries: Vec<MinimapEntry>,
}

/// Aggregate counts across the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub session_count: u64,
    pub message_count: u64,
    pub project_count: u64,
    pub machine_count: u64,
    pub earliest_session: Option<DateTime<Utc>>,
    pub latest_session: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub session_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectsResponse {
    pub projects: Vec<ProjectInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachinesResponse {
    pub machines: Vec<String>,
}

/// One full-text search match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub session_id: SessionId,
    pub project: String,
    pub ordinal: u64,
    pub role: String,
    /// Matched content with `<mark>` around hits
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub fts: bool,
}
