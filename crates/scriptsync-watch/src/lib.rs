//! Script change sources for scriptsync.
//!
//! This crate defines the [`ChangeSource`] trait the synchronizer consumes.
//! The `fs` backend watches the filesystem for either every script matching a
//! glob under a root directory or one pinned script. The `mock` backend lets
//! tests feed events by hand.

use std::path::PathBuf;

use async_trait::async_trait;
use scriptsync_types::ChangeEvent;
use tokio::sync::mpsc;

pub mod error;

#[cfg(feature = "fs")]
pub mod fs;

#[cfg(feature = "mock")]
pub mod mock;

pub use error::WatchError;

/// Default glob for user scripts.
pub const DEFAULT_PATTERN: &str = "**/*.user.js";

/// What a filesystem change source should watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Every file under `root` whose relative path matches `pattern`.
    Pattern { root: PathBuf, pattern: String },
    /// A single pinned script.
    Script(PathBuf),
}

impl WatchTarget {
    /// Watch every `*.user.js` under `root`.
    pub fn user_scripts(root: impl Into<PathBuf>) -> Self {
        Self::Pattern {
            root: root.into(),
            pattern: DEFAULT_PATTERN.to_string(),
        }
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pattern { root, pattern } => write!(f, "{}/{pattern}", root.display()),
            Self::Script(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Produces change events for watched scripts.
///
/// A source is started once. Dropping or shutting it down ends the
/// subscription; the synchronizer swaps sources by shutting the old one down
/// before starting the new one.
#[async_trait]
pub trait ChangeSource: Send + 'static {
    /// Start reporting changes to `tx`.
    async fn start(&mut self, tx: mpsc::Sender<ChangeEvent>) -> Result<(), WatchError>;

    /// Stop reporting and release all resources.
    async fn shutdown(&mut self) -> Result<(), WatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_display() {
        let target = WatchTarget::user_scripts("/work");
        assert_eq!(target.to_string(), "/work/**/*.user.js");
        let pinned = WatchTarget::Script(PathBuf::from("/work/a.user.js"));
        assert_eq!(pinned.to_string(), "/work/a.user.js");
    }
}
