//! The port marker: a one-line file naming the port the owner listens on.
//!
//! Readers must tolerate a marker that is missing, stale, or removed between
//! two calls. Writers go through a temporary file and a rename so a reader
//! never sees a half-written port number.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::RegistryError;

/// Handle on the marker file at a fixed path.
#[derive(Debug, Clone)]
pub struct PortMarker {
    path: PathBuf,
}

impl PortMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded port, or `None` if there is no marker.
    pub fn read(&self) -> Result<Option<u16>, RegistryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RegistryError::io(&self.path, e)),
        };
        let port = contents
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| RegistryError::InvalidMarker {
                path: self.path.clone(),
                contents: contents.clone(),
            })?;
        trace!(port, path = %self.path.display(), "read port marker");
        Ok(Some(port))
    }

    /// Atomically replace the marker with `port`.
    pub fn write(&self, port: u16) -> Result<(), RegistryError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| RegistryError::io(dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        std::fs::write(&tmp, format!("{port}\n")).map_err(|e| RegistryError::io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(RegistryError::io(&self.path, e));
        }
        debug!(port, path = %self.path.display(), "wrote port marker");
        Ok(())
    }

    /// Remove the marker. Returns `false` if it was already gone.
    pub fn remove(&self) -> Result<bool, RegistryError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed port marker");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RegistryError::io(&self.path, e)),
        }
    }

    /// Remove the marker only if it still records `port`.
    pub fn remove_if(&self, port: u16) -> Result<bool, RegistryError> {
        match self.read() {
            Ok(Some(recorded)) if recorded == port => self.remove(),
            Ok(_) => Ok(false),
            Err(RegistryError::InvalidMarker { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
