//! Filesystem change source backed by `notify`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use scriptsync_types::ChangeEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::{ChangeSource, WatchTarget};

/// Decides whether a reported path belongs to the watch target.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    kind: MatcherKind,
}

#[derive(Debug, Clone)]
enum MatcherKind {
    Pattern {
        roots: Vec<PathBuf>,
        pattern: Pattern,
    },
    Script {
        paths: Vec<PathBuf>,
    },
}

impl TargetMatcher {
    pub fn new(target: &WatchTarget) -> Result<Self, WatchError> {
        let kind = match target {
            WatchTarget::Pattern { root, pattern } => MatcherKind::Pattern {
                roots: with_canonical(root),
                pattern: Pattern::new(pattern).map_err(|e| WatchError::Pattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?,
            },
            WatchTarget::Script(path) => MatcherKind::Script {
                paths: with_canonical(path),
            },
        };
        Ok(Self { kind })
    }

    pub fn matches(&self, path: &Path) -> bool {
        match &self.kind {
            MatcherKind::Pattern { roots, pattern } => {
                match roots.iter().find_map(|root| path.strip_prefix(root).ok()) {
                    Some(relative) => pattern.matches_path(relative),
                    None => pattern.matches_path(path),
                }
            }
            MatcherKind::Script { paths } => {
                paths.iter().any(|p| p == path)
                    || std::fs::canonicalize(path).is_ok_and(|c| paths.contains(&c))
            }
        }
    }
}

/// The path as given plus its canonical form, if it differs.
fn with_canonical(path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![path.to_path_buf()];
    if let Ok(canonical) = std::fs::canonicalize(path) {
        if canonical != path {
            paths.push(canonical);
        }
    }
    paths
}

/// Watches the filesystem for changes to user scripts.
pub struct FsChangeSource {
    target: WatchTarget,
    debounce: Duration,
    watcher: Option<RecommendedWatcher>,
    forwarder: Option<JoinHandle<()>>,
}

impl FsChangeSource {
    pub fn new(target: WatchTarget, debounce: Duration) -> Self {
        Self {
            target,
            debounce,
            watcher: None,
            forwarder: None,
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    fn watch_root(&self) -> (PathBuf, RecursiveMode) {
        match &self.target {
            WatchTarget::Pattern { root, .. } => (root.clone(), RecursiveMode::Recursive),
            // Editors often save by renaming over the file, so watch the
            // directory rather than the inode.
            WatchTarget::Script(path) => (
                path.parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
                RecursiveMode::NonRecursive,
            ),
        }
    }
}

#[async_trait]
impl ChangeSource for FsChangeSource {
    async fn start(&mut self, tx: mpsc::Sender<ChangeEvent>) -> Result<(), WatchError> {
        if self.watcher.is_some() {
            return Err(WatchError::AlreadyStarted);
        }

        let matcher = TargetMatcher::new(&self.target)?;
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_content_change(&event.kind) => {
                for path in event.paths.into_iter().filter(|p| matcher.matches(p)) {
                    let _ = raw_tx.send(path);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "script watch error"),
        })
        .map_err(|e| WatchError::Watch {
            path: self.target.to_string(),
            reason: e.to_string(),
        })?;

        let (root, mode) = self.watch_root();
        watcher.watch(&root, mode).map_err(|e| WatchError::Watch {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;

        self.forwarder = Some(tokio::spawn(forward_debounced(raw_rx, tx, self.debounce)));
        self.watcher = Some(watcher);
        info!(target = %self.target, "watching scripts");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), WatchError> {
        self.watcher = None;
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        debug!(target = %self.target, "stopped watching scripts");
        Ok(())
    }
}

impl Drop for FsChangeSource {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Collapse bursts of events for the same path into a single change.
async fn forward_debounced(
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    tx: mpsc::Sender<ChangeEvent>,
    window: Duration,
) {
    while let Some(first) = raw_rx.recv().await {
        let mut pending = vec![first];
        let deadline = Instant::now() + window;
        while let Ok(Some(path)) = tokio::time::timeout_at(deadline, raw_rx.recv()).await {
            if !pending.contains(&path) {
                pending.push(path);
            }
        }
        for path in pending {
            if tx.send(ChangeEvent::from_path(path)).await.is_err() {
                return;
            }
        }
    }
}
