//! File-change events consumed by the synchronizer.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A change reported by a change source.
///
/// `path` is `None` for resources that are not backed by a regular file on
/// disk (virtual documents, remote schemes). Such events are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub uri: String,
    pub path: Option<PathBuf>,
    pub timestamp: SystemTime,
}

impl ChangeEvent {
    /// An event for a file on the local filesystem.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            uri: file_uri(&path),
            path: Some(path),
            timestamp: SystemTime::now(),
        }
    }

    /// An event for a resource with no local file behind it.
    pub fn virtual_resource(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            path: None,
            timestamp: SystemTime::now(),
        }
    }

    /// The local path, if the event comes from a `file:` resource.
    pub fn file_path(&self) -> Option<&Path> {
        if self.uri.starts_with("file:") {
            self.path.as_deref()
        } else {
            None
        }
    }
}

/// Render a path as a `file://` URI.
///
/// Separators are normalised to `/`; no percent-encoding is applied, which
/// matches how script URIs are shown to the script engine.
pub fn file_uri(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    if s.starts_with('/') {
        format!("file://{s}")
    } else {
        format!("file:///{s}")
    }
}
