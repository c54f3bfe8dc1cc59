//! Integration tests for the transcript tailer.
//!
//! These tests drive `Tailer::poll_once` against real files in a temp
//! directory and check what lands in the store and on the bus.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use asv_core::SessionId;
use asvd::bus::NotificationBus;
use asvd::deadline::Deadline;
use asvd::store::{SessionStore, SqliteStore};
use asvd::tailer::Tailer;
use tempfile::TempDir;

// ============================================================================
// Constants
// ============================================================================

const TEST_DEADLINE: Duration = Duration::from_secs(5);
const PROJECT: &str = "demo-project";
const SESSION: &str = "0b6f4c1e-session";

// ============================================================================
// Test Helpers
// ============================================================================

struct Fixture {
    store: Arc<SqliteStore>,
    bus: NotificationBus,
    tailer: Tailer,
    transcript: PathBuf,
    _temp_dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let project = temp_dir.path().join(PROJECT);
        std::fs::create_dir_all(&project).unwrap();
        let transcript = project.join(format!("{SESSION}.jsonl"));
        std::fs::write(&transcript, "").unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus = NotificationBus::default();
        let tailer = Tailer::new(temp_dir.path(), store.clone(), bus.clone())
            .with_machine("test-box");

        Self {
            store,
            bus,
            tailer,
            transcript,
            _temp_dir: temp_dir,
        }
    }

    fn append(&self, text: &str) {
        append(&self.transcript, text);
    }

    async fn message_count(&self) -> u64 {
        self.store
            .get_session(&SessionId::new(SESSION), &Deadline::after(TEST_DEADLINE))
            .await
            .unwrap()
            .map_or(0, |s| s.message_count)
    }

    async fn contents(&self) -> Vec<String> {
        self.store
            .get_messages(&SessionId::new(SESSION), 0, 100, &Deadline::after(TEST_DEADLINE))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect()
    }
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn record(n: usize) -> String {
    format!(
        r#"{{"type":"user","timestamp":"2024-06-01T10:00:{:02}Z","message":{{"role":"user","content":"line {n}"}}}}"#,
        n % 60
    ) + "\n"
}

/// Minimal record with flat content, as simpler agents write them.
fn flat(content: &str) -> String {
    format!(r#"{{"type":"user","content":"{content}"}}"#) + "\n"
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_appended_records_are_applied_once() {
    let mut fx = Fixture::new();
    let mut sub = fx.bus.subscribe(SessionId::new(SESSION));

    let batch: String = (0..4).map(record).collect();
    fx.append(&batch);

    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 4);
    assert_eq!(report.events, 1);
    assert_eq!(fx.message_count().await, 4);

    let event = tokio::time::timeout(TEST_DEADLINE, sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.message_count, 4);
    assert!(!event.missed_updates);

    // A second cycle with no growth changes nothing.
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 0);
    assert_eq!(report.events, 0);
    assert_eq!(fx.message_count().await, 4);
}

#[tokio::test]
async fn test_session_metadata_from_layout() {
    let mut fx = Fixture::new();
    fx.append(&record(1));
    fx.tailer.poll_once().await;

    let session = fx
        .store
        .get_session(&SessionId::new(SESSION), &Deadline::after(TEST_DEADLINE))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.project, PROJECT);
    assert_eq!(session.machine.as_deref(), Some("test-box"));
    let source = session.source.unwrap();
    assert_eq!(source.path, fx.transcript);
    assert_eq!(source.offset, std::fs::metadata(&fx.transcript).unwrap().len());
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let mut fx = Fixture::new();
    fx.append(&record(1));
    fx.append("{not json at all\n");
    fx.append(&record(2));

    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(fx.contents().await, vec!["line 1", "line 2"]);
}

#[tokio::test]
async fn test_partial_line_waits_for_newline() {
    let mut fx = Fixture::new();
    let full = record(7);
    let (head, tail) = full.split_at(20);

    fx.append(head);
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 0);
    assert_eq!(fx.message_count().await, 0);

    fx.append(tail);
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 1);
    assert_eq!(fx.contents().await, vec!["line 7"]);
}

#[tokio::test]
async fn test_truncated_file_is_reingested() {
    let mut fx = Fixture::new();
    let batch: String = (0..3).map(record).collect();
    fx.append(&batch);
    fx.tailer.poll_once().await;
    assert_eq!(fx.message_count().await, 3);

    std::fs::write(&fx.transcript, record(9)).unwrap();
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.events, 1);
    assert_eq!(fx.message_count().await, 1);
    assert_eq!(fx.contents().await, vec!["line 9"]);
}

#[tokio::test]
async fn test_removed_file_stops_tracking() {
    let mut fx = Fixture::new();
    fx.append(&record(1));
    fx.tailer.poll_once().await;
    assert_eq!(fx.tailer.tracked_files(), 1);

    std::fs::remove_file(&fx.transcript).unwrap();
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.stalled, 1);
    assert_eq!(fx.tailer.tracked_files(), 0);
    assert_eq!(fx.tailer.stalled_files(), 1);

    // Stored data outlives the file.
    assert_eq!(fx.message_count().await, 1);
}

#[tokio::test]
async fn test_reappearing_file_replaces_stored_messages() {
    let mut fx = Fixture::new();
    fx.append(&flat("a"));
    fx.append(&flat("b"));
    fx.tailer.poll_once().await;
    assert_eq!(fx.contents().await, vec!["a", "b"]);

    std::fs::remove_file(&fx.transcript).unwrap();
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.stalled, 1);

    // New file at the same path, longer than the old one. The inode may
    // well be reused.
    let mut sub = fx.bus.subscribe(SessionId::new(SESSION));
    std::fs::write(&fx.transcript, flat("x1") + &flat("x2") + &flat("x3")).unwrap();
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 3);
    assert_eq!(report.events, 1);
    assert_eq!(fx.tailer.tracked_files(), 1);
    assert_eq!(fx.tailer.stalled_files(), 0);
    assert_eq!(fx.contents().await, vec!["x1", "x2", "x3"]);
    assert_eq!(fx.message_count().await, 3);

    let event = tokio::time::timeout(TEST_DEADLINE, sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.message_count, 3);

    // And it is tailed normally from there on.
    fx.append(&flat("x4"));
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 1);
    assert_eq!(fx.message_count().await, 4);
}

#[tokio::test]
async fn test_in_place_rewrite_is_reingested_and_published() {
    let mut fx = Fixture::new();
    std::fs::write(&fx.transcript, r#"{"type":"user"}"#).unwrap();
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 1);

    let mut sub = fx.bus.subscribe(SessionId::new(SESSION));
    std::fs::write(&fx.transcript, r#"{"type":"user","content":"update"}"#).unwrap();
    let report = fx.tailer.poll_once().await;
    assert_eq!(report.applied, 1);
    assert_eq!(report.events, 1);
    assert_eq!(fx.contents().await, vec!["update"]);

    let event = tokio::time::timeout(TEST_DEADLINE, sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.message_count, 1);
}

#[tokio::test]
async fn test_restart_over_a_different_file_replaces_messages() {
    let mut fx = Fixture::new();
    fx.append(&flat("old-1"));
    fx.append(&flat("old-2"));
    fx.tailer.poll_once().await;

    // Replaced while no tailer was running, at least as long as before.
    std::fs::write(&fx.transcript, flat("new-1") + &flat("new-2") + &flat("new-3")).unwrap();
    let root = fx.tailer.root().to_path_buf();
    let mut restarted = Tailer::new(root, fx.store.clone(), fx.bus.clone());
    let report = restarted.poll_once().await;
    assert_eq!(report.applied, 3);
    assert_eq!(fx.contents().await, vec!["new-1", "new-2", "new-3"]);
}

#[tokio::test]
async fn test_new_tailer_resumes_from_stored_offset() {
    let mut fx = Fixture::new();
    let batch: String = (0..2).map(record).collect();
    fx.append(&batch);
    fx.tailer.poll_once().await;

    let root = fx.tailer.root().to_path_buf();
    let mut restarted = Tailer::new(root, fx.store.clone(), fx.bus.clone());
    let report = restarted.poll_once().await;
    assert_eq!(report.applied, 0);
    assert_eq!(fx.message_count().await, 2);

    fx.append(&record(3));
    let report = restarted.poll_once().await;
    assert_eq!(report.applied, 1);
    assert_eq!(fx.message_count().await, 3);
}

#[tokio::test]
async fn test_ordinals_are_contiguous_across_cycles() {
    let mut fx = Fixture::new();
    for n in 0..3 {
        fx.append(&record(n));
        fx.tailer.poll_once().await;
    }
    let ordinals: Vec<u64> = fx
        .store
        .get_messages(&SessionId::new(SESSION), 0, 100, &Deadline::after(TEST_DEADLINE))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.ordinal)
        .collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
}
