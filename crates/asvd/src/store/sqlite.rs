//! SQLite implementation of the storage facade.
//!
//! A single connection sits behind an async mutex. Each operation takes the
//! lock, then runs synchronously on a blocking thread. If the caller's
//! deadline fires while the operation is running, the connection is
//! interrupted; the enclosing transaction rolls back and nothing partial
//! becomes visible.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, InterruptHandle, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use asv_core::{
    format_timestamp, parse_timestamp, DomainError, Message, PruneFilter, Session, SessionFilter,
    SessionId, SourceCursor,
};
use asv_protocol::{MinimapEntry, ProjectInfo, SearchHit, StatsResponse};

use super::query::{fts_query, session_where, WhereClause, SESSION_ORDER};
use super::{IngestBatch, SessionPage, SessionStore, StoreError, StoreResult};
use crate::deadline::Deadline;

/// How long a statement waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages inserted between deadline checks inside one batch.
const DEADLINE_CHECK_EVERY: usize = 256;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    project       TEXT NOT NULL,
    machine       TEXT,
    started_at    TEXT,
    ended_at      TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    source_path   TEXT,
    source_offset INTEGER NOT NULL DEFAULT 0,
    source_inode  INTEGER,
    source_fingerprint TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_started_at ON sessions(started_at);
CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);

CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    ordinal    INTEGER NOT NULL,
    timestamp  TEXT,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    UNIQUE(session_id, ordinal)
);
";

const FTS_SCHEMA: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
    USING fts5(content, content='messages', content_rowid='id');
CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.id, old.content);
END;
";

const SESSION_COLUMNS: &str = "id, project, machine, started_at, ended_at, message_count, \
                               source_path, source_offset, source_inode, source_fingerprint";

/// Columns added after the first release, with their definitions.
const LATE_COLUMNS: &[(&str, &str)] = &[("source_fingerprint", "TEXT")];

// ============================================================================
// SqliteStore
// ============================================================================

/// Session store backed by one SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    fts: bool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened session database");
        Self::init(conn, true)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, true)
    }

    /// Opens a private in-memory database without the full-text index.
    pub fn open_in_memory_without_fts() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, false)
    }

    fn init(conn: Connection, want_fts: bool) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        add_late_columns(&conn)?;

        let fts = want_fts
            && match conn.execute_batch(FTS_SCHEMA) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Full-text search unavailable");
                    false
                }
            };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            fts,
        })
    }

    /// Runs `op` against the connection on a blocking thread, bounded by
    /// `deadline`.
    ///
    /// When the deadline fires mid-operation the connection is interrupted
    /// and the caller gets the deadline error, unless `op` had already
    /// finished successfully, in which case its (committed) result is
    /// returned so callers never re-apply work that was persisted.
    async fn run<T, F>(&self, deadline: &Deadline, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Deadline) -> StoreResult<T> + Send + 'static,
    {
        deadline.check()?;

        let guard = tokio::select! {
            biased;
            reason = deadline.done() => return Err(reason.into()),
            guard = Arc::clone(&self.conn).lock_owned() => guard,
        };
        deadline.check()?;

        let interrupt = InterruptSlot::new(guard.get_interrupt_handle());
        let _on_drop = InterruptOnDrop(interrupt.clone());
        let op_interrupt = interrupt.clone();
        let op_deadline = deadline.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = guard;
            // Dropped before `conn`: the slot is disarmed while this
            // operation still owns the connection.
            let _armed = DisarmOnExit(op_interrupt);
            op(&mut *conn, &op_deadline)
        });

        let joined = tokio::select! {
            joined = &mut task => joined,
            reason = deadline.done() => {
                interrupt.fire();
                // The blocking task holds the connection until it returns.
                return match task.await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(_)) | Err(_) => Err(reason.into()),
                };
            }
        };

        joined.map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Interrupt handle that is only usable while its operation holds the
/// connection.
///
/// The operation disarms the slot before releasing the connection, and
/// `fire` interrupts under the same lock, so an interrupt can never reach
/// the next operation on the shared connection.
#[derive(Clone)]
struct InterruptSlot(Arc<StdMutex<Option<InterruptHandle>>>);

impl InterruptSlot {
    fn new(handle: InterruptHandle) -> Self {
        Self(Arc::new(StdMutex::new(Some(handle))))
    }

    fn fire(&self) {
        let slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            handle.interrupt();
        }
    }

    fn disarm(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Interrupts the in-flight statement if the awaiting future is dropped
/// (client disconnected) before the operation finished.
struct InterruptOnDrop(InterruptSlot);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// Disarms the slot when the operation returns or unwinds.
struct DisarmOnExit(InterruptSlot);

impl Drop for DisarmOnExit {
    fn drop(&mut self) {
        self.0.disarm();
    }
}

/// Brings databases created before a column existed up to date.
fn add_late_columns(conn: &Connection) -> rusqlite::Result<()> {
    let existing = {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('sessions')")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
    };
    for (name, definition) in LATE_COLUMNS {
        if !existing.iter().any(|column| column == name) {
            debug!(column = name, "Adding sessions column");
            conn.execute_batch(&format!("ALTER TABLE sessions ADD COLUMN {name} {definition}"))?;
        }
    }
    Ok(())
}

// ============================================================================
// Row Mapping
// ============================================================================

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_column_ts(raw: Option<String>) -> Option<chrono::DateTime<chrono::Utc>> {
    raw.as_deref().and_then(parse_timestamp)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let source_path: Option<String> = row.get(6)?;
    let source_offset: i64 = row.get(7)?;
    let source_inode: Option<i64> = row.get(8)?;
    let source_fingerprint: Option<String> = row.get(9)?;

    Ok(Session {
        id: SessionId::new(row.get::<_, String>(0)?),
        project: row.get(1)?,
        machine: row.get(2)?,
        started_at: parse_column_ts(row.get(3)?),
        ended_at: parse_column_ts(row.get(4)?),
        message_count: from_sql_int(row.get(5)?),
        source: source_path.map(|path| SourceCursor {
            path: PathBuf::from(path),
            offset: from_sql_int(source_offset),
            // Bit-preserving: inodes are opaque identities
            inode: source_inode.map(|inode| inode as u64),
            fingerprint: source_fingerprint,
        }),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        session_id: SessionId::new(row.get::<_, String>(0)?),
        ordinal: from_sql_int(row.get(1)?),
        timestamp: parse_column_ts(row.get(2)?),
        role: row.get(3)?,
        content: row.get(4)?,
    })
}

fn load_session(conn: &Connection, id: &SessionId) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
        [id.as_str()],
        session_from_row,
    )
    .optional()
}

fn session_exists(conn: &Connection, id: &SessionId) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM sessions WHERE id = ?1", [id.as_str()], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
}

fn write_session(conn: &Connection, session: &Session) -> rusqlite::Result<()> {
    let (source_path, source_offset, source_inode, source_fingerprint) = match &session.source {
        Some(src) => (
            Some(src.path.to_string_lossy().into_owned()),
            to_sql_int(src.offset),
            src.inode.map(|inode| inode as i64),
            src.fingerprint.clone(),
        ),
        None => (None, 0, None, None),
    };

    conn.execute(
        "INSERT INTO sessions (id, project, machine, started_at, ended_at, message_count,
                               source_path, source_offset, source_inode, source_fingerprint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
             project = excluded.project,
             machine = excluded.machine,
             started_at = excluded.started_at,
             ended_at = excluded.ended_at,
             message_count = excluded.message_count,
             source_path = excluded.source_path,
             source_offset = excluded.source_offset,
             source_inode = excluded.source_inode,
             source_fingerprint = excluded.source_fingerprint",
        params![
            session.id.as_str(),
            session.project,
            session.machine,
            session.started_at.as_ref().map(format_timestamp),
            session.ended_at.as_ref().map(format_timestamp),
            to_sql_int(session.message_count),
            source_path,
            source_offset,
            source_inode,
            source_fingerprint,
        ],
    )?;
    Ok(())
}

/// Inserts `messages` after the session's current last ordinal and folds
/// them into the session's count and time window.
fn insert_messages(
    conn: &Connection,
    session: &mut Session,
    messages: &[Message],
    deadline: &Deadline,
) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO messages (session_id, ordinal, timestamp, role, content)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (i, msg) in messages.iter().enumerate() {
        if i % DEADLINE_CHECK_EVERY == 0 {
            deadline.check()?;
        }
        stmt.execute(params![
            session.id.as_str(),
            to_sql_int(session.message_count),
            msg.timestamp.as_ref().map(format_timestamp),
            msg.role,
            msg.content,
        ])?;
        session.record_message(msg.timestamp);
    }
    Ok(())
}

fn select_sessions(
    conn: &Connection,
    filter: &SessionFilter,
    limit: Option<usize>,
) -> rusqlite::Result<Vec<Session>> {
    let clause = session_where(filter);
    let mut params = clause.params.clone();
    let mut sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions{} {SESSION_ORDER}",
        clause.sql()
    );
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        params.push(Value::Integer(to_sql_limit(limit)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let sessions = stmt
        .query_map(params_from_iter(params.iter()), session_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sessions)
}

/// Deletes each listed session that also satisfies `clause`, in one
/// transaction. Messages go with their session through the cascade.
fn delete_listed(
    conn: &mut Connection,
    ids: &[SessionId],
    clause: &WhereClause,
    deadline: &Deadline,
) -> StoreResult<u64> {
    let sql = format!("DELETE FROM sessions WHERE id = ?{}", clause.and_sql());
    let tx = conn.transaction()?;
    let mut removed = 0u64;
    {
        let mut stmt = tx.prepare(&sql)?;
        for id in ids {
            deadline.check()?;
            let params = std::iter::once(Value::Text(id.as_str().to_string()))
                .chain(clause.params.iter().cloned());
            let changed = stmt.execute(params_from_iter(params))?;
            removed = removed.saturating_add(u64::try_from(changed).unwrap_or(0));
        }
    }
    deadline.check()?;
    tx.commit()?;
    Ok(removed)
}

// ============================================================================
// SessionStore Implementation
// ============================================================================

#[async_trait]
impl SessionStore for SqliteStore {
    async fn upsert_session(&self, session: &Session, deadline: &Deadline) -> StoreResult<()> {
        let session = session.clone();
        self.run(deadline, move |conn, _| {
            write_session(conn, &session)?;
            Ok(())
        })
        .await
    }

    async fn append_messages(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        deadline: &Deadline,
    ) -> StoreResult<Session> {
        let session_id = session_id.clone();
        let messages = messages.to_vec();
        self.run(deadline, move |conn, deadline| {
            let tx = conn.transaction()?;
            let mut session =
                load_session(&tx, &session_id)?.ok_or(StoreError::NotFound(session_id))?;
            insert_messages(&tx, &mut session, &messages, deadline)?;
            write_session(&tx, &session)?;
            deadline.check()?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    async fn ingest(&self, batch: IngestBatch, deadline: &Deadline) -> StoreResult<Session> {
        self.run(deadline, move |conn, deadline| {
            let IngestBatch {
                session: incoming,
                messages,
                replace,
            } = batch;

            let tx = conn.transaction()?;
            let existing = if replace {
                tx.execute(
                    "DELETE FROM messages WHERE session_id = ?1",
                    [incoming.id.as_str()],
                )?;
                None
            } else {
                load_session(&tx, &incoming.id)?
            };

            let mut session = match existing {
                Some(mut current) => {
                    current.project = incoming.project;
                    current.machine = incoming.machine.or(current.machine.take());
                    current.source = incoming.source;
                    current
                }
                None => Session {
                    message_count: 0,
                    started_at: None,
                    ended_at: None,
                    ..incoming
                },
            };

            // Row must exist before messages reference it.
            write_session(&tx, &session)?;
            insert_messages(&tx, &mut session, &messages, deadline)?;
            write_session(&tx, &session)?;

            deadline.check()?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    async fn get_session(
        &self,
        id: &SessionId,
        deadline: &Deadline,
    ) -> StoreResult<Option<Session>> {
        let id = id.clone();
        self.run(deadline, move |conn, _| Ok(load_session(conn, &id)?))
            .await
    }

    async fn find_sessions(
        &self,
        filter: &SessionFilter,
        deadline: &Deadline,
    ) -> StoreResult<Vec<Session>> {
        let filter = filter.clone();
        self.run(deadline, move |conn, _| Ok(select_sessions(conn, &filter, None)?))
            .await
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: usize,
        deadline: &Deadline,
    ) -> StoreResult<SessionPage> {
        let filter = filter.clone();
        self.run(deadline, move |conn, deadline| {
            let tx = conn.transaction()?;
            let clause = session_where(&filter);
            let total: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM sessions{}", clause.sql()),
                params_from_iter(clause.params.iter()),
                |row| row.get(0),
            )?;
            deadline.check()?;
            let sessions = select_sessions(&tx, &filter, Some(limit))?;
            Ok(SessionPage {
                sessions,
                total: from_sql_int(total),
            })
        })
        .await
    }

    async fn delete_sessions(&self, ids: &[SessionId], deadline: &Deadline) -> StoreResult<u64> {
        let ids = ids.to_vec();
        self.run(deadline, move |conn, deadline| {
            delete_listed(conn, &ids, &WhereClause::default(), deadline)
        })
        .await
    }

    async fn prune_sessions(
        &self,
        filter: &PruneFilter,
        ids: &[SessionId],
        deadline: &Deadline,
    ) -> StoreResult<u64> {
        let filter = filter.to_session_filter()?;
        let ids = ids.to_vec();
        self.run(deadline, move |conn, deadline| {
            delete_listed(conn, &ids, &session_where(&filter), deadline)
        })
        .await
    }

    async fn get_messages(
        &self,
        id: &SessionId,
        from: u64,
        limit: usize,
        deadline: &Deadline,
    ) -> StoreResult<Vec<Message>> {
        let id = id.clone();
        self.run(deadline, move |conn, _| {
            if !session_exists(conn, &id)? {
                return Err(StoreError::NotFound(id));
            }
            let mut stmt = conn.prepare_cached(
                "SELECT session_id, ordinal, timestamp, role, content FROM messages
                 WHERE session_id = ?1 AND ordinal >= ?2
                 ORDER BY ordinal LIMIT ?3",
            )?;
            let messages = stmt
                .query_map(
                    params![id.as_str(), to_sql_int(from), to_sql_limit(limit)],
                    message_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }

    async fn get_minimap(
        &self,
        id: &SessionId,
        deadline: &Deadline,
    ) -> StoreResult<Vec<MinimapEntry>> {
        let id = id.clone();
        self.run(deadline, move |conn, _| {
            if !session_exists(conn, &id)? {
                return Err(StoreError::NotFound(id));
            }
            let mut stmt = conn.prepare_cached(
                "SELECT ordinal, role, length(content), timestamp FROM messages
                 WHERE session_id = ?1 ORDER BY ordinal",
            )?;
            let entries = stmt
                .query_map([id.as_str()], |row| {
                    Ok(MinimapEntry {
                        ordinal: from_sql_int(row.get(0)?),
                        role: row.get(1)?,
                        length: from_sql_int(row.get(2)?),
                        timestamp: parse_column_ts(row.get(3)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn stats(&self, deadline: &Deadline) -> StoreResult<StatsResponse> {
        self.run(deadline, |conn, _| {
            let stats = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(message_count), 0),
                        COUNT(DISTINCT project), COUNT(DISTINCT machine),
                        MIN(started_at), MAX(started_at)
                 FROM sessions",
                [],
                |row| {
                    Ok(StatsResponse {
                        session_count: from_sql_int(row.get(0)?),
                        message_count: from_sql_int(row.get(1)?),
                        project_count: from_sql_int(row.get(2)?),
                        machine_count: from_sql_int(row.get(3)?),
                        earliest_session: parse_column_ts(row.get(4)?),
                        latest_session: parse_column_ts(row.get(5)?),
                    })
                },
            )?;
            Ok(stats)
        })
        .await
    }

    async fn list_projects(&self, deadline: &Deadline) -> StoreResult<Vec<ProjectInfo>> {
        self.run(deadline, |conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT project, COUNT(*) FROM sessions GROUP BY project ORDER BY project",
            )?;
            let projects = stmt
                .query_map([], |row| {
                    Ok(ProjectInfo {
                        name: row.get(0)?,
                        session_count: from_sql_int(row.get(1)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects)
        })
        .await
    }

    async fn list_machines(&self, deadline: &Deadline) -> StoreResult<Vec<String>> {
        self.run(deadline, |conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT machine FROM sessions
                 WHERE machine IS NOT NULL AND machine != ''
                 ORDER BY machine",
            )?;
            let machines = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(machines)
        })
        .await
    }

    fn has_fts(&self) -> bool {
        self.fts
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        deadline: &Deadline,
    ) -> StoreResult<Vec<SearchHit>> {
        if !self.fts {
            return Err(StoreError::FtsUnavailable);
        }
        let fts = fts_query(query)
            .ok_or_else(|| DomainError::validation("search query is required"))?;

        self.run(deadline, move |conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT m.session_id, s.project, m.ordinal, m.role,
                        snippet(messages_fts, 0, '<mark>', '</mark>', '...', 16)
                 FROM messages_fts
                 JOIN messages m ON m.id = messages_fts.rowid
                 JOIN sessions s ON s.id = m.session_id
                 WHERE messages_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )?;
            let hits = stmt
                .query_map(params![fts, to_sql_limit(limit)], |row| {
                    Ok(SearchHit {
                        session_id: SessionId::new(row.get::<_, String>(0)?),
                        project: row.get(1)?,
                        ordinal: from_sql_int(row.get(2)?),
                        role: row.get(3)?,
                        snippet: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hits)
        })
        .await
    }
}
