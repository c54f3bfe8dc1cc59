//! Session domain entities and value objects.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for an agent session.
///
/// Taken from the transcript file stem (e.g. `8e11bfb5-7dc2-432b-9206-928fa5c35731`
/// for `8e11bfb5-7dc2-432b-9206-928fa5c35731.jsonl`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the session id from a transcript path.
    ///
    /// Returns `None` when the path has no UTF-8 file stem.
    pub fn from_transcript_path(path: &Path) -> Option<Self> {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .map(Self::new)
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Formats a timestamp the way it is persisted: RFC 3339, UTC, milliseconds.
///
/// The fixed width keeps lexical and chronological order identical, which
/// the storage layer relies on for range predicates.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

// ============================================================================
// Tail Source
// ============================================================================

/// Where a session's transcript lives and how much of it has been applied.
///
/// Persisted with the session so tailing can resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceCursor {
    /// Transcript file path
    pub path: PathBuf,
    /// Bytes of the file already applied to storage
    pub offset: u64,
    /// File identity (inode) when the platform exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    /// Digest of the applied bytes at the start and end of the applied
    /// range. A file at the same path whose bytes no longer hash the same
    /// is a different file, even if its inode was reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

// ============================================================================
// Session Entity
// ============================================================================

/// A transcript session.
///
/// Created on the first parsed record of a new transcript file and updated
/// only by the tailer. `message_count` always equals the number of messages
/// applied for this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier (transcript file stem)
    pub id: SessionId,

    /// Project directory name the transcript was found under
    pub project: String,

    /// Label of the machine that produced the transcript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,

    /// Earliest record timestamp
    pub started_at: Option<DateTime<Utc>>,

    /// Latest record timestamp
    pub ended_at: Option<DateTime<Utc>>,

    /// Number of messages applied
    pub message_count: u64,

    /// Tail cursor, absent for sessions not backed by a file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceCursor>,
}

impl Session {
    /// Creates an empty session for the given project.
    pub fn new(id: impl Into<SessionId>, project: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project: project.into(),
            machine: None,
            started_at: None,
            ended_at: None,
            message_count: 0,
            source: None,
        }
    }

    /// Sets the machine label.
    #[must_use]
    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    /// Sets the start timestamp.
    #[must_use]
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Sets the message count.
    #[must_use]
    pub fn with_message_count(mut self, message_count: u64) -> Self {
        self.message_count = message_count;
        self
    }

    /// Accounts for one more applied message.
    ///
    /// Widens the `[started_at, ended_at]` window to include `timestamp`.
    pub fn record_message(&mut self, timestamp: Option<DateTime<Utc>>) {
        self.message_count = self.message_count.saturating_add(1);
        if let Some(ts) = timestamp {
            self.started_at = Some(self.started_at.map_or(ts, |cur| cur.min(ts)));
            self.ended_at = Some(self.ended_at.map_or(ts, |cur| cur.max(ts)));
        }
    }

    /// Returns the UTC calendar day the session started on.
    pub fn started_on(&self) -> Option<NaiveDate> {
        self.started_at.map(|ts| ts.date_naive())
    }
}

// ============================================================================
// Message Entity
// ============================================================================

/// One transcript record applied to a session.
///
/// Immutable once stored; the source file is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Owning session
    pub session_id: SessionId,

    /// Zero-based position within the session
    pub ordinal: u64,

    /// Record timestamp, when the record carried one
    pub timestamp: Option<DateTime<Utc>>,

    /// Record type tag (`user`, `assistant`, `summary`, ...)
    pub role: String,

    /// Extracted text content
    pub content: String,
}
