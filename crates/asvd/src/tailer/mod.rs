//! Incremental transcript ingestion.
//!
//! The tailer scans `<root>/<project>/<session>.jsonl`, keeps one
//! [`TailCursor`] per file, and on every cycle applies newly appended
//! records to the store in one batch per file. After a batch commits it
//! publishes exactly one [`ChangeEvent`] for that session.
//!
//! Per file the state machine is `Unseen -> Tracking -> (Tracking | Stalled)`.
//! A stalled (vanished) file is dropped from the cursor table. If a file
//! shows up again at a stalled path it is a new file: it gets a fresh
//! cursor and its content replaces the session's stored messages.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Malformed records are skipped, never fatal
//! - A storage failure rolls the cursor back and only affects that file

mod cursor;
mod watch;

pub use cursor::{TailChunk, TailCursor};
pub use watch::{watch_transcripts, TranscriptWatcher, WatchError};

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use asv_core::{Session, SessionId};
use asv_protocol::{parse_record, ChangeEvent};

use crate::bus::NotificationBus;
use crate::deadline::Deadline;
use crate::store::{IngestBatch, SessionStore};

/// Transcript file extension.
pub const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Lower bound on the fallback poll period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on one batch apply or cursor lookup.
const APPLY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Discovery
// ============================================================================

/// A transcript found under the projects root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFile {
    pub path: PathBuf,
    pub session_id: SessionId,
    pub project: String,
}

/// Lists `<root>/<project>/<session>.jsonl` files, sorted by path.
///
/// A missing root yields an empty list.
pub fn discover_transcripts(root: &Path) -> Vec<TranscriptFile> {
    let mut files: Vec<TranscriptFile> = WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXTENSION) {
                return None;
            }
            let session_id = SessionId::from_transcript_path(&path)?;
            let project = path
                .parent()
                .and_then(Path::file_name)
                .and_then(|name| name.to_str())?
                .to_string();
            Some(TranscriptFile {
                path,
                session_id,
                project,
            })
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

fn fresh_cursor(file: &TranscriptFile) -> TailCursor {
    TailCursor::new(
        file.path.clone(),
        file.session_id.clone(),
        file.project.clone(),
    )
}

// ============================================================================
// Tail Report
// ============================================================================

/// Outcome of one tail cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailReport {
    /// Files tracked after the cycle
    pub files: usize,
    /// Messages applied to storage
    pub applied: usize,
    /// Malformed records skipped
    pub skipped: usize,
    /// Change events published (one per touched session)
    pub events: usize,
    /// Files whose batch failed and will be retried
    pub failed: usize,
    /// Files dropped because they disappeared
    pub stalled: usize,
}

impl TailReport {
    /// Returns true if the cycle changed nothing.
    pub fn is_quiet(&self) -> bool {
        self.applied == 0 && self.skipped == 0 && self.failed == 0 && self.stalled == 0
    }
}

// ============================================================================
// Tailer
// ============================================================================

/// Owns the cursor table and applies transcript growth to the store.
pub struct Tailer {
    root: PathBuf,
    store: Arc<dyn SessionStore>,
    bus: NotificationBus,
    machine: Option<String>,
    cursors: HashMap<PathBuf, TailCursor>,
    /// Paths whose file disappeared while tracked
    stalled: HashSet<PathBuf>,
    cancel: CancellationToken,
}

impl Tailer {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn SessionStore>, bus: NotificationBus) -> Self {
        Self {
            root: root.into(),
            store,
            bus,
            machine: None,
            cursors: HashMap::new(),
            stalled: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Labels every session this tailer creates.
    #[must_use]
    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        let machine = machine.into();
        self.machine = (!machine.is_empty()).then_some(machine);
        self
    }

    /// Cancelling `cancel` aborts in-flight applies.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files currently in the `Tracking` state.
    pub fn tracked_files(&self) -> usize {
        self.cursors.len()
    }

    /// Number of vanished paths waiting to reappear.
    pub fn stalled_files(&self) -> usize {
        self.stalled.len()
    }

    /// Runs one scan-and-apply cycle over every transcript.
    pub async fn poll_once(&mut self) -> TailReport {
        let mut report = TailReport::default();

        let root = self.root.clone();
        let files = match tokio::task::spawn_blocking(move || discover_transcripts(&root)).await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Transcript discovery task failed");
                report.files = self.cursors.len();
                return report;
            }
        };

        let present: HashSet<&Path> = files.iter().map(|f| f.path.as_path()).collect();
        let gone: Vec<PathBuf> = self
            .cursors
            .keys()
            .filter(|path| !present.contains(path.as_path()))
            .cloned()
            .collect();
        for path in &gone {
            self.stall(path, &mut report);
        }

        for file in &files {
            if !self.cursors.contains_key(&file.path) {
                let opened = if self.stalled.remove(&file.path) {
                    info!(
                        path = %file.path.display(),
                        "Transcript reappeared, re-reading as a new file"
                    );
                    Some(fresh_cursor(file).with_reset())
                } else {
                    self.open_cursor(file).await
                };
                match opened {
                    Some(cursor) => {
                        debug!(path = %file.path.display(), offset = cursor.offset(), "Tracking transcript");
                        self.cursors.insert(file.path.clone(), cursor);
                    }
                    None => continue,
                }
            }
            self.tail_file(&file.path, &mut report).await;
        }

        report.files = self.cursors.len();
        report
    }

    /// Builds the cursor for a newly observed file, resuming from the
    /// stored offset when the session was already ingested from this path.
    ///
    /// Returns `None` if the store could not be consulted; the file is
    /// retried next cycle.
    async fn open_cursor(&self, file: &TranscriptFile) -> Option<TailCursor> {
        let deadline = self.apply_deadline();
        match self.store.get_session(&file.session_id, &deadline).await {
            Ok(None) => Some(fresh_cursor(file)),
            Ok(Some(session)) => match session.source {
                Some(source) if source.path == file.path => Some(TailCursor::resume(
                    file.path.clone(),
                    file.session_id.clone(),
                    file.project.clone(),
                    &source,
                )),
                // Same session id, different file: its content wins.
                _ => Some(fresh_cursor(file).with_reset()),
            },
            Err(e) => {
                warn!(
                    path = %file.path.display(),
                    error = %e,
                    "Failed to look up stored session, will retry"
                );
                None
            }
        }
    }

    async fn tail_file(&mut self, path: &Path, report: &mut TailReport) {
        let Some(snapshot) = self.cursors.get(path).cloned() else {
            return;
        };

        let read = tokio::task::spawn_blocking(move || snapshot.read_new()).await;
        let chunk = match read {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                self.stall(path, report);
                return;
            }
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "Failed to read transcript");
                report.failed += 1;
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Transcript read task failed");
                report.failed += 1;
                return;
            }
        };

        let Some(cursor) = self.cursors.get_mut(path) else {
            return;
        };

        let session_id = cursor.session_id().clone();
        let mut messages = Vec::with_capacity(chunk.lines.len());
        for line in &chunk.lines {
            match parse_record(line) {
                Ok(record) => messages.push(record.into_message(session_id.clone(), 0)),
                Err(e) => {
                    debug!(
                        path = %path.display(),
                        session_id = %session_id,
                        error = %e,
                        "Skipping malformed transcript record"
                    );
                    report.skipped += 1;
                }
            }
        }

        // Nothing to persist: remember the buffered tail and move on.
        if messages.is_empty() && !chunk.replace {
            cursor.commit(&chunk);
            return;
        }

        let mut session = Session::new(session_id.clone(), cursor.project());
        session.machine = self.machine.clone();
        session.source = Some(chunk.source(path));

        let applied = messages.len();
        let batch = IngestBatch {
            session,
            messages,
            replace: chunk.replace,
        };

        let deadline = Deadline::new(self.cancel.child_token(), Some(APPLY_TIMEOUT));
        match self.store.ingest(batch, &deadline).await {
            Ok(session) => {
                cursor.commit(&chunk);
                report.applied += applied;
                report.events += 1;
                let reached = self.bus.publish(ChangeEvent::for_session(&session));
                debug!(
                    session_id = %session_id,
                    offset = chunk.end_offset,
                    applied,
                    message_count = session.message_count,
                    watchers = reached,
                    "Applied transcript records"
                );
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    session_id = %session_id,
                    error = %e,
                    "Failed to apply transcript records, will retry"
                );
                cursor.rollback(&chunk);
                report.failed += 1;
            }
        }
    }

    /// Moves `path` from `Tracking` to `Stalled`.
    fn stall(&mut self, path: &Path, report: &mut TailReport) {
        if self.cursors.remove(path).is_some() {
            info!(path = %path.display(), "Transcript gone, tracking stopped");
            self.stalled.insert(path.to_path_buf());
            report.stalled += 1;
        }
    }

    fn apply_deadline(&self) -> Deadline {
        Deadline::new(self.cancel.child_token(), Some(APPLY_TIMEOUT))
    }

    /// Tails until `cancel` fires, waking on filesystem events and at least
    /// every `poll_interval`.
    pub async fn run(mut self, poll_interval: Duration, cancel: CancellationToken) {
        self.cancel = cancel.clone();

        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let _watcher = match watch_transcripts(&self.root, wake_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(
                    root = %self.root.display(),
                    error = %e,
                    "Filesystem notifications unavailable, polling only"
                );
                None
            }
        };

        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            root = %self.root.display(),
            poll_ms = poll_interval.as_millis() as u64,
            "Tailer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = wake_rx.recv() => {}
            }

            let report = self.poll_once().await;
            if !report.is_quiet() {
                info!(
                    files = report.files,
                    applied = report.applied,
                    skipped = report.skipped,
                    events = report.events,
                    failed = report.failed,
                    stalled = report.stalled,
                    "Tail cycle complete"
                );
            }
        }

        info!("Tailer stopped");
    }
}

/// Spawns `tailer` on the runtime.
pub fn spawn_tailer(
    tailer: Tailer,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(tailer.run(poll_interval, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_layout() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("my-proj");
        std::fs::create_dir_all(proj.join("nested")).unwrap();
        std::fs::write(proj.join("b.jsonl"), "").unwrap();
        std::fs::write(proj.join("a.jsonl"), "").unwrap();
        std::fs::write(proj.join("notes.txt"), "").unwrap();
        std::fs::write(proj.join("nested").join("deep.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("top.jsonl"), "").unwrap();

        let files = discover_transcripts(dir.path());
        let ids: Vec<&str> = files.iter().map(|f| f.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(files.iter().all(|f| f.project == "my-proj"));
    }

    #[test]
    fn test_discovery_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_transcripts(&dir.path().join("absent")).is_empty());
    }

    #[test]
    fn test_quiet_report() {
        assert!(TailReport::default().is_quiet());
        let report = TailReport {
            applied: 1,
            ..Default::default()
        };
        assert!(!report.is_quiet());
    }
}
