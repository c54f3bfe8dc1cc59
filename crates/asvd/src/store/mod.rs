//! Storage facade for sessions and messages.
//!
//! `SessionStore` is the query/update contract the rest of the daemon
//! depends on. The tailer is its only writer; HTTP handlers only read.
//! Every operation takes the caller's [`Deadline`] and aborts with
//! `StoreError::DeadlineExceeded` or `StoreError::Cancelled` once it fires,
//! never with a partial result.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Integer conversions between SQLite and domain types saturate
//! - Blocking task failures are mapped to `StoreError::Task`

mod query;
mod sqlite;

pub use query::fts_query;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use asv_core::{DomainError, Message, PruneFilter, Session, SessionFilter, SessionId};
use asv_protocol::{MinimapEntry, ProjectInfo, SearchHit, StatsResponse};

use crate::deadline::{Deadline, DeadlineError};

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("full-text search is not available")]
    FtsUnavailable,

    /// Caller input rejected before touching storage
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<DeadlineError> for StoreError {
    fn from(err: DeadlineError) -> Self {
        match err {
            DeadlineError::Exceeded => Self::DeadlineExceeded,
            DeadlineError::Cancelled => Self::Cancelled,
        }
    }
}

impl StoreError {
    /// Returns true if the error came from the caller's deadline.
    #[must_use]
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::Cancelled)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Facade Types
// ============================================================================

/// Messages parsed from one tail cycle of one file, applied atomically.
#[derive(Debug, Clone)]
pub struct IngestBatch {
    /// Identity, project, machine and the new source cursor.
    ///
    /// Counts and timestamps are derived by the store from the messages.
    pub session: Session,

    /// Parsed messages in file order. Ordinals are assigned by the store.
    pub messages: Vec<Message>,

    /// Drop the session's existing messages first (file truncated or replaced)
    pub replace: bool,
}

/// One page of a session listing.
#[derive(Debug, Clone, Default)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    /// Number of matching sessions before the limit was applied
    pub total: u64,
}

// ============================================================================
// Store Contract
// ============================================================================

/// Query/update contract over persisted sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts or replaces the session row keyed by id.
    async fn upsert_session(&self, session: &Session, deadline: &Deadline) -> StoreResult<()>;

    /// Appends messages to an existing session and returns its new state.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the session does not exist.
    async fn append_messages(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        deadline: &Deadline,
    ) -> StoreResult<Session>;

    /// Applies one tail cycle's worth of messages in a single transaction,
    /// creating the session if needed, and returns its new state.
    async fn ingest(&self, batch: IngestBatch, deadline: &Deadline) -> StoreResult<Session>;

    async fn get_session(&self, id: &SessionId, deadline: &Deadline)
        -> StoreResult<Option<Session>>;

    /// Returns every session matching `filter`. The empty filter matches all.
    async fn find_sessions(
        &self,
        filter: &SessionFilter,
        deadline: &Deadline,
    ) -> StoreResult<Vec<Session>>;

    /// Returns the newest `limit` sessions matching `filter` plus the total.
    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: usize,
        deadline: &Deadline,
    ) -> StoreResult<SessionPage>;

    /// Returns the sessions a prune with `filter` would delete.
    ///
    /// # Errors
    ///
    /// `StoreError::Validation` ("at least one filter is required") when the
    /// filter has no predicates; storage is not touched in that case.
    async fn find_prune_candidates(
        &self,
        filter: &PruneFilter,
        deadline: &Deadline,
    ) -> StoreResult<Vec<Session>> {
        let filter = filter.to_session_filter()?;
        self.find_sessions(&filter, deadline).await
    }

    /// Deletes sessions and their messages. Returns the number removed.
    async fn delete_sessions(&self, ids: &[SessionId], deadline: &Deadline) -> StoreResult<u64>;

    /// Deletes the listed sessions that still match `filter` when the
    /// delete runs. Sessions that stopped matching since the candidate
    /// search (for example because they grew) are kept.
    ///
    /// # Errors
    ///
    /// `StoreError::Validation` when the filter has no predicates.
    async fn prune_sessions(
        &self,
        filter: &PruneFilter,
        ids: &[SessionId],
        deadline: &Deadline,
    ) -> StoreResult<u64>;

    /// Returns up to `limit` messages starting at ordinal `from`.
    async fn get_messages(
        &self,
        id: &SessionId,
        from: u64,
        limit: usize,
        deadline: &Deadline,
    ) -> StoreResult<Vec<Message>>;

    async fn get_minimap(
        &self,
        id: &SessionId,
        deadline: &Deadline,
    ) -> StoreResult<Vec<MinimapEntry>>;

    async fn stats(&self, deadline: &Deadline) -> StoreResult<StatsResponse>;

    async fn list_projects(&self, deadline: &Deadline) -> StoreResult<Vec<ProjectInfo>>;

    async fn list_machines(&self, deadline: &Deadline) -> StoreResult<Vec<String>>;

    /// Whether full-text search over message content is available.
    fn has_fts(&self) -> bool;

    /// Full-text search over message content.
    ///
    /// # Errors
    ///
    /// `StoreError::FtsUnavailable` when [`has_fts`](Self::has_fts) is false.
    async fn search(
        &self,
        query: &str,
        limit: usize,
        deadline: &Deadline,
    ) -> StoreResult<Vec<SearchHit>>;
}
