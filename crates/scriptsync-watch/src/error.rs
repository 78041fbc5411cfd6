//! Change source errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid watch pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("failed to watch {path}: {reason}")]
    Watch { path: String, reason: String },

    #[error("change source already started")]
    AlreadyStarted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
