//! Filesystem notifications that wake the tailer early.

use std::path::Path;

use notify::event::EventKind;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// Keeps the OS watcher alive; dropping it stops notifications.
pub struct TranscriptWatcher {
    _watcher: RecommendedWatcher,
}

/// Watches `root` recursively and sends a wake-up on `wake` for every
/// transcript change.
///
/// Wake-ups are coalesced: with a full channel the signal is dropped, since
/// the pending one already makes the tailer rescan everything.
pub fn watch_transcripts(
    root: &Path,
    wake: mpsc::Sender<()>,
) -> Result<TranscriptWatcher, WatchError> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if should_wake(&event) {
                    let _ = wake.try_send(());
                }
            }
            Err(error) => {
                debug!(error = %error, "Transcript watch error");
                let _ = wake.try_send(());
            }
        },
        Config::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;

    Ok(TranscriptWatcher { _watcher: watcher })
}

fn should_wake(event: &notify::Event) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    if event.paths.is_empty() {
        return true;
    }

    // Extension-less paths are project directories appearing or vanishing.
    event.paths.iter().any(|path| match path.extension() {
        Some(ext) => ext == "jsonl",
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: Vec<&str>) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.into_iter().map(PathBuf::from).collect(),
            attrs: notify::event::EventAttributes::default(),
        }
    }

    #[test]
    fn ignores_access_events() {
        let event = event(EventKind::Access(AccessKind::Any), vec!["/p/proj/a.jsonl"]);
        assert!(!should_wake(&event));
    }

    #[test]
    fn wakes_for_transcript_writes() {
        let event = event(EventKind::Modify(ModifyKind::Any), vec!["/p/proj/a.jsonl"]);
        assert!(should_wake(&event));
    }

    #[test]
    fn wakes_for_new_project_directory() {
        let event = event(EventKind::Create(CreateKind::Folder), vec!["/p/new-proj"]);
        assert!(should_wake(&event));
    }

    #[test]
    fn ignores_other_files() {
        let event = event(EventKind::Modify(ModifyKind::Any), vec!["/p/proj/notes.txt"]);
        assert!(!should_wake(&event));
    }

    #[tokio::test]
    async fn signals_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let _watcher = watch_transcripts(dir.path(), tx).unwrap();

        std::fs::write(dir.path().join("s.jsonl"), "{}\n").unwrap();

        let woke = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(woke, Ok(Some(()))));
    }
}
