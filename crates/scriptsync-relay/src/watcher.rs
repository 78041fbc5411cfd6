//! Owner-side spool watcher.

use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::spool::is_spool_file;

/// Reports spool files as they appear.
///
/// The same file may be reported more than once (create and rename events);
/// consumers treat an already-deleted file as nothing to do.
pub struct SpoolWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<PathBuf>,
    dir: PathBuf,
}

impl SpoolWatcher {
    /// Start watching `dir`, creating it if needed.
    pub fn watch(dir: &Path) -> Result<Self, RelayError> {
        std::fs::create_dir_all(dir).map_err(|source| RelayError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_arrival(&event.kind) => {
                for path in event.paths.into_iter().filter(|p| is_spool_file(p)) {
                    let _ = tx.send(path);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "spool watch error"),
        })
        .map_err(|e| RelayError::Watch(e.to_string()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| RelayError::Watch(e.to_string()))?;

        debug!(dir = %dir.display(), "watching spool");
        Ok(Self {
            _watcher: watcher,
            rx,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Wait for the next spool file to appear.
    pub async fn next(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}
