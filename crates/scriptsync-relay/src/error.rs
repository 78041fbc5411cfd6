//! Relay subsystem errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to write relay message {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read relay message {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid relay message {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("failed to encode relay message: {0}")]
    Encode(String),

    #[error("spool watch failed: {0}")]
    Watch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
