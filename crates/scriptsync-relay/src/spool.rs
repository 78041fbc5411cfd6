//! Spool directory: the follower-to-owner message drop.
//!
//! Followers only ever add files; the owner only ever drains them. The one
//! exception is expiry: a writer deletes its own file once the TTL elapses,
//! whether or not an owner picked it up.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scriptsync_protocol::wire::{decode_message, encode_message};
use scriptsync_types::Message;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::RelayError;

/// How long an unconsumed relay message may stay in the spool.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Extension of complete spool files. Temporary files never carry it.
pub const SPOOL_EXTENSION: &str = "json";

/// Writer and housekeeping handle on a spool directory.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
    ttl: Duration,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop a message into the spool for the owner to pick up.
    ///
    /// The file is written under a hidden temporary name and renamed into
    /// place. A deletion is scheduled after the TTL in case no owner drains
    /// it. Must be called from within a Tokio runtime.
    pub async fn relay(&self, message: &Message) -> Result<PathBuf, RelayError> {
        let text = encode_message(message).map_err(|e| RelayError::Encode(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| RelayError::Write {
                path: self.dir.clone(),
                source,
            })?;

        let name = spool_file_name();
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.tmp"));

        tokio::fs::write(&tmp, text)
            .await
            .map_err(|source| RelayError::Write {
                path: tmp.clone(),
                source,
            })?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(RelayError::Write { path, source });
        }

        schedule_expiry(path.clone(), self.ttl);
        debug!(path = %path.display(), action = %message.action, "relayed message to spool");
        Ok(path)
    }

    /// Delete spool entries (and stray temporary files) older than the TTL.
    ///
    /// Used by a freshly started owner to clear what crashed writers left.
    pub async fn sweep_expired(&self) -> Result<usize, RelayError> {
        let mut removed = 0;
        for path in self.entries(true).await? {
            let age = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified.elapsed().unwrap_or_default(),
                Err(_) => continue,
            };
            if age >= self.ttl && remove_spool_file(&path).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "swept expired spool files");
        }
        Ok(removed)
    }

    /// Complete spool files currently present, oldest first.
    pub async fn backlog(&self) -> Result<Vec<PathBuf>, RelayError> {
        self.entries(false).await
    }

    async fn entries(&self, include_temporary: bool) -> Result<Vec<PathBuf>, RelayError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RelayError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if is_spool_file(&path) || (include_temporary && is_temporary(&path)) {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(RelayError::Read {
                        path: self.dir.clone(),
                        source,
                    })
                }
            }
        }
        // Names start with a zero-padded millisecond timestamp.
        paths.sort();
        Ok(paths)
    }
}

/// A fresh, collision-free spool file name: `<millis>-<random>.json`.
pub fn spool_file_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!(
        "{millis:013}-{}.{SPOOL_EXTENSION}",
        Uuid::new_v4().simple()
    )
}

/// Whether `path` names a complete spool file.
pub fn is_spool_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    !hidden && path.extension().and_then(|e| e.to_str()) == Some(SPOOL_EXTENSION)
}

fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(".tmp"))
}

/// Read and parse one spool file. Returns `None` if it is already gone.
pub async fn read_spool_file(path: &Path) -> Result<Option<Message>, RelayError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RelayError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let message = decode_message(&text).map_err(|e| RelayError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    trace!(path = %path.display(), action = %message.action, "read spool file");
    Ok(Some(message))
}

/// Delete a spool file. A file that is already gone counts as success and
/// yields `false`.
pub async fn remove_spool_file(path: &Path) -> Result<bool, RelayError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(RelayError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn schedule_expiry(path: PathBuf, ttl: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        match remove_spool_file(&path).await {
            Ok(true) => debug!(path = %path.display(), "expired unconsumed relay message"),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "failed to expire relay message"),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use scriptsync_types::ScriptChange;

    fn change() -> Message {
        Message::on_change(&ScriptChange::new(
            "console.log(1)",
            "file:///tmp/x.user.js",
        ))
    }

    #[test]
    fn spool_names_are_unique_and_recognised() {
        let names: HashSet<String> = (0..100).map(|_| spool_file_name()).collect();
        assert_eq!(names.len(), 100);
        for name in &names {
            assert!(is_spool_file(Path::new(name)));
        }
    }

    #[test]
    fn temporary_and_foreign_files_are_not_spool_files() {
        assert!(!is_spool_file(Path::new(".123-abc.json.tmp")));
        assert!(!is_spool_file(Path::new(".hidden.json")));
        assert!(!is_spool_file(Path::new("notes.txt")));
        assert!(is_temporary(Path::new(".123-abc.json.tmp")));
    }

    #[tokio::test]
    async fn relay_writes_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool"), Duration::from_secs(60));

        let path = spool.relay(&change()).await.unwrap();
        assert!(is_spool_file(&path));

        let read = read_spool_file(&path).await.unwrap().unwrap();
        assert_eq!(read, change());

        // Only the final file is left behind.
        assert_eq!(spool.backlog().await.unwrap(), vec![path]);
        assert_eq!(spool.entries(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unconsumed_message_expires() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path(), Duration::from_millis(50));

        let path = spool.relay(&change()).await.unwrap();
        assert!(path.exists());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!path.exists());

        // Cleaning up again is not an error.
        assert!(!remove_spool_file(&path).await.unwrap());
        assert!(!remove_spool_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let read = read_spool_file(&dir.path().join("gone.json")).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn garbage_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_spool_file(&path).await.unwrap_err();
        assert!(matches!(err, RelayError::Parse { .. }));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0000000000001-a.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".0000000000001-b.json.tmp"), "{").unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        let patient = Spool::new(dir.path(), Duration::from_secs(3600));
        assert_eq!(patient.sweep_expired().await.unwrap(), 0);

        let strict = Spool::new(dir.path(), Duration::ZERO);
        assert_eq!(strict.sweep_expired().await.unwrap(), 2);
        assert!(dir.path().join("keep.txt").exists());
        assert!(strict.backlog().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backlog_is_ordered_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["0000000000300-c.json", "0000000000100-a.json", "0000000000200-b.json"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        let spool = Spool::new(dir.path(), DEFAULT_TTL);
        let names: Vec<String> = spool
            .backlog()
            .await
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            ["0000000000100-a.json", "0000000000200-b.json", "0000000000300-c.json"]
        );
    }
}
