//! Per-file read cursor.
//!
//! A cursor remembers how many bytes of a transcript have been applied to
//! storage and how many trailing bytes were seen that do not yet form a
//! whole record. Reading never mutates the cursor; the tailer commits a
//! chunk after storage accepted it, or rolls back so the same bytes are
//! read again on the next cycle.
//!
//! File identity is checked on every read. A different inode, a file
//! shorter than what was seen, or applied bytes that no longer match the
//! recorded fingerprint all mean the path now holds another file, which is
//! then read from the start as a replacement.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use asv_core::{SessionId, SourceCursor};

/// Bytes hashed at each end of the applied range.
const FINGERPRINT_WINDOW: u64 = 256;

/// Complete records read past the committed offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailChunk {
    /// Non-blank record lines in file order
    pub lines: Vec<String>,
    /// File offset just past the last consumed record
    pub end_offset: u64,
    /// Bytes after `end_offset` that do not yet form a record
    pub rest: Vec<u8>,
    /// The file was truncated or replaced; stored messages must be dropped
    pub replace: bool,
    /// File identity observed during this read
    pub inode: Option<u64>,
    /// Fingerprint of the bytes up to `end_offset`
    pub fingerprint: Option<String>,
}

impl TailChunk {
    /// Returns true when there is nothing to apply.
    pub fn is_idle(&self) -> bool {
        self.lines.is_empty() && !self.replace
    }

    /// Source cursor to persist once this chunk is applied.
    pub fn source(&self, path: &Path) -> SourceCursor {
        SourceCursor {
            path: path.to_path_buf(),
            offset: self.end_offset,
            inode: self.inode,
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Read position within one transcript file.
#[derive(Debug, Clone)]
pub struct TailCursor {
    path: PathBuf,
    session_id: SessionId,
    project: String,
    offset: u64,
    pending: u64,
    inode: Option<u64>,
    fingerprint: Option<String>,
    needs_reset: bool,
}

impl TailCursor {
    /// Cursor at the start of a file never seen before.
    pub fn new(path: PathBuf, session_id: SessionId, project: String) -> Self {
        Self {
            path,
            session_id,
            project,
            offset: 0,
            pending: 0,
            inode: None,
            fingerprint: None,
            needs_reset: false,
        }
    }

    /// Cursor continuing from a persisted position.
    pub fn resume(
        path: PathBuf,
        session_id: SessionId,
        project: String,
        stored: &SourceCursor,
    ) -> Self {
        Self {
            offset: stored.offset,
            inode: stored.inode,
            fingerprint: stored.fingerprint.clone(),
            ..Self::new(path, session_id, project)
        }
    }

    /// Marks the next applied chunk as a replacement of stored messages.
    #[must_use]
    pub fn with_reset(mut self) -> Self {
        self.needs_reset = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Committed offset: bytes already applied to storage.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes seen past the committed offset that are not a record yet.
    pub fn pending_len(&self) -> u64 {
        self.pending
    }

    /// Reads everything after the committed offset.
    ///
    /// Pending bytes are read again from the file rather than from memory,
    /// so a partial line rewritten in place is never stitched to stale
    /// bytes. A file that is not the one the offset belongs to restarts
    /// from offset zero with `replace` set. Blocking; call from a blocking
    /// thread.
    ///
    /// # Errors
    ///
    /// Any I/O error; `NotFound` means the file disappeared.
    pub fn read_new(&self) -> io::Result<TailChunk> {
        let mut file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let inode = file_inode(&meta);
        let len = meta.len();

        let replaced = matches!((self.inode, inode), (Some(old), Some(new)) if old != new);
        let truncated = len < self.offset.saturating_add(self.pending);
        let rewritten = !replaced
            && !truncated
            && self.fingerprint.is_some()
            && fingerprint(&mut file, self.offset)? != self.fingerprint;

        let (base, replace) = if replaced || truncated || rewritten {
            info!(
                path = %self.path.display(),
                replaced,
                truncated,
                rewritten,
                "Transcript rewritten, re-reading from start"
            );
            (0, true)
        } else {
            (self.offset, self.needs_reset)
        };

        let mut data = Vec::new();
        if len > base {
            read_range(&mut file, base, len - base, &mut data)?;
        }

        let (mut lines, mut consumed) = split_records(&data);
        let rest = data.get(consumed..).unwrap_or_default();
        if is_complete_object(rest) {
            lines.push(String::from_utf8_lossy(rest).trim().to_string());
            consumed = data.len();
        }

        let end_offset = base.saturating_add(consumed as u64);
        let fingerprint = if end_offset == self.offset && !replace {
            self.fingerprint.clone()
        } else {
            fingerprint(&mut file, end_offset)?
        };

        Ok(TailChunk {
            lines,
            end_offset,
            rest: data.get(consumed..).unwrap_or_default().to_vec(),
            replace,
            inode,
            fingerprint,
        })
    }

    /// Advances past a chunk that storage accepted.
    pub fn commit(&mut self, chunk: &TailChunk) {
        self.offset = chunk.end_offset;
        self.pending = chunk.rest.len() as u64;
        self.inode = chunk.inode;
        self.fingerprint = chunk.fingerprint.clone();
        self.needs_reset = false;
    }

    /// Forgets a chunk that storage rejected so it is read again.
    pub fn rollback(&mut self, chunk: &TailChunk) {
        self.pending = 0;
        if chunk.replace {
            self.offset = 0;
            self.inode = chunk.inode;
            self.fingerprint = None;
            self.needs_reset = true;
        }
    }
}

/// Appends `len` bytes starting at `at` to `buf`. Stops early at end of file.
fn read_range(file: &mut File, at: u64, len: u64, buf: &mut Vec<u8>) -> io::Result<()> {
    file.seek(SeekFrom::Start(at))?;
    file.by_ref().take(len).read_to_end(buf)?;
    Ok(())
}

/// Hashes the first and last [`FINGERPRINT_WINDOW`] bytes before `offset`.
///
/// `None` for an empty range: there is nothing to compare yet.
fn fingerprint(file: &mut File, offset: u64) -> io::Result<Option<String>> {
    if offset == 0 {
        return Ok(None);
    }
    let window = offset.min(FINGERPRINT_WINDOW);
    let mut bytes = Vec::new();
    read_range(file, 0, window, &mut bytes)?;
    read_range(file, offset - window, window, &mut bytes)?;

    let mut hasher = Sha256::new();
    hasher.update(offset.to_le_bytes());
    hasher.update(&bytes);
    Ok(Some(format!("{:x}", hasher.finalize())))
}

/// Splits `data` at newlines, returning the non-blank complete lines and the
/// number of bytes they span (through the last newline).
fn split_records(data: &[u8]) -> (Vec<String>, usize) {
    let Some(last_newline) = data.iter().rposition(|b| *b == b'\n') else {
        return (Vec::new(), 0);
    };
    let complete = data.get(..=last_newline).unwrap_or_default();

    let lines = complete
        .split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
        .filter(|line| !line.trim().is_empty())
        .collect();

    (lines, last_newline + 1)
}

/// A trailing fragment is consumed early only when it is already a whole
/// JSON object; anything else waits for its newline.
fn is_complete_object(fragment: &[u8]) -> bool {
    if fragment.iter().all(u8::is_ascii_whitespace) {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(fragment).is_ok_and(|value| value.is_object())
}

#[cfg(unix)]
fn file_inode(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_inode(_meta: &fs::Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cursor_for(path: &Path) -> TailCursor {
        TailCursor::new(path.to_path_buf(), SessionId::new("s"), "proj".to_string())
    }

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n{\"b\":");

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        assert_eq!(chunk.lines, vec!["{\"a\":1}"]);
        assert_eq!(chunk.end_offset, 8);
        assert_eq!(chunk.rest, b"{\"b\":".to_vec());
        cursor.commit(&chunk);
        assert_eq!(cursor.pending_len(), 5);
        assert_eq!(cursor.offset(), 8);

        append(&path, "2}\n");
        let chunk = cursor.read_new().unwrap();
        assert_eq!(chunk.lines, vec!["{\"b\":2}"]);
        assert_eq!(chunk.end_offset, 16);
        assert!(chunk.rest.is_empty());
    }

    #[test]
    fn test_trailing_complete_object_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n{\"b\":2}");

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        assert_eq!(chunk.lines.len(), 2);
        assert_eq!(chunk.end_offset, 15);
        cursor.commit(&chunk);

        // The late newline is a blank line and yields nothing.
        append(&path, "\n");
        let chunk = cursor.read_new().unwrap();
        assert!(chunk.lines.is_empty());
        assert_eq!(chunk.end_offset, 16);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\r\n\n   \n{\"b\":2}\n");

        let chunk = cursor_for(&path).read_new().unwrap();
        assert_eq!(chunk.lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_no_new_bytes_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n");

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        cursor.commit(&chunk);

        let again = cursor.read_new().unwrap();
        assert!(again.is_idle());
        assert_eq!(again.end_offset, 8);
    }

    #[test]
    fn test_truncation_restarts_with_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n{\"b\":2}\n");

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        cursor.commit(&chunk);

        fs::write(&path, "{\"c\":3}\n").unwrap();
        let chunk = cursor.read_new().unwrap();
        assert!(chunk.replace);
        assert_eq!(chunk.lines, vec!["{\"c\":3}"]);
        assert_eq!(chunk.end_offset, 8);
    }

    #[cfg(unix)]
    #[test]
    fn test_replaced_file_restarts_with_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n");

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        cursor.commit(&chunk);

        let other = dir.path().join("other.jsonl");
        append(&other, "{\"x\":1}\n{\"y\":2}\n");
        fs::rename(&other, &path).unwrap();

        let chunk = cursor.read_new().unwrap();
        assert!(chunk.replace);
        assert_eq!(chunk.lines.len(), 2);
    }

    #[test]
    fn test_rollback_rereads_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n");

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        cursor.rollback(&chunk);
        assert_eq!(cursor.offset(), 0);

        let again = cursor.read_new().unwrap();
        assert_eq!(again, chunk);
    }

    #[test]
    fn test_resume_skips_applied_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n{\"b\":2}\n");

        let stored = SourceCursor {
            path: path.clone(),
            offset: 8,
            ..Default::default()
        };
        let cursor = TailCursor::resume(path, SessionId::new("s"), "proj".to_string(), &stored);
        let chunk = cursor.read_new().unwrap();
        assert_eq!(chunk.lines, vec!["{\"b\":2}"]);
        assert!(!chunk.replace);
    }

    #[test]
    fn test_in_place_rewrite_restarts_with_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        fs::write(&path, r#"{"type":"user"}"#).unwrap();

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        assert_eq!(chunk.lines, vec![r#"{"type":"user"}"#]);
        cursor.commit(&chunk);

        // Longer than before and, on most filesystems, the same inode.
        fs::write(&path, r#"{"type":"user","content":"update"}"#).unwrap();
        let chunk = cursor.read_new().unwrap();
        assert!(chunk.replace);
        assert_eq!(chunk.lines, vec![r#"{"type":"user","content":"update"}"#]);
        assert_eq!(chunk.end_offset, 34);
    }

    #[test]
    fn test_rewritten_partial_line_is_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n{\"b\":");

        let mut cursor = cursor_for(&path);
        let chunk = cursor.read_new().unwrap();
        cursor.commit(&chunk);

        // Applied bytes untouched, partial line replaced.
        fs::write(&path, "{\"a\":1}\n{\"c\":3}\n").unwrap();
        let chunk = cursor.read_new().unwrap();
        assert!(!chunk.replace);
        assert_eq!(chunk.lines, vec!["{\"c\":3}"]);
    }

    #[test]
    fn test_resume_with_matching_fingerprint_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n");

        let chunk = cursor_for(&path).read_new().unwrap();
        let stored = chunk.source(&path);
        assert!(stored.fingerprint.is_some());

        append(&path, "{\"b\":2}\n");
        let cursor =
            TailCursor::resume(path.clone(), SessionId::new("s"), "proj".to_string(), &stored);
        let chunk = cursor.read_new().unwrap();
        assert!(!chunk.replace);
        assert_eq!(chunk.lines, vec!["{\"b\":2}"]);
    }

    #[test]
    fn test_resume_over_different_content_restarts_with_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"a\":1}\n{\"b\":2}\n");
        let stored = cursor_for(&path).read_new().unwrap().source(&path);

        // A new file at the same path, at least as long, same inode.
        fs::write(&path, "{\"x\":1}\n{\"y\":2}\n{\"z\":3}\n").unwrap();
        let cursor =
            TailCursor::resume(path.clone(), SessionId::new("s"), "proj".to_string(), &stored);
        let chunk = cursor.read_new().unwrap();
        assert!(chunk.replace);
        assert_eq!(chunk.lines.len(), 3);
        assert_eq!(chunk.lines[0], "{\"x\":1}");
    }

    #[test]
    fn test_fingerprint_ignores_appended_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, &"{\"k\":\"0123456789\"}\n".repeat(40));

        let mut file = File::open(&path).unwrap();
        let before = fingerprint(&mut file, 200).unwrap();
        append(&path, "{\"late\":true}\n");
        let mut file = File::open(&path).unwrap();
        assert_eq!(fingerprint(&mut file, 200).unwrap(), before);
        assert_ne!(fingerprint(&mut file, 201).unwrap(), before);
        assert_eq!(fingerprint(&mut file, 0).unwrap(), None);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = cursor_for(&dir.path().join("gone.jsonl"))
            .read_new()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
