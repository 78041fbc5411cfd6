//! Service identity: the port and the coordination directory shared by every
//! process on the machine.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};

/// Default listening port of the broadcast endpoint.
pub const DEFAULT_PORT: u16 = 8642;

/// File inside the coordination directory recording the owned port.
pub const MARKER_FILE_NAME: &str = "port";

/// Directory inside the coordination directory holding relay messages.
pub const SPOOL_DIR_NAME: &str = "spool";

/// Identifies one broadcast service across processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    port: u16,
    coordination_dir: PathBuf,
}

impl ServiceIdentity {
    pub fn new(port: u16, coordination_dir: impl Into<PathBuf>) -> Self {
        Self {
            port,
            coordination_dir: coordination_dir.into(),
        }
    }

    /// `<temp_dir>/scriptsync`, shared by every user process on the machine.
    pub fn default_coordination_dir() -> PathBuf {
        std::env::temp_dir().join("scriptsync")
    }

    /// The port a new owner binds.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn coordination_dir(&self) -> &Path {
        &self.coordination_dir
    }

    pub fn marker_path(&self) -> PathBuf {
        self.coordination_dir.join(MARKER_FILE_NAME)
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.coordination_dir.join(SPOOL_DIR_NAME)
    }

    /// Loopback address for the given port.
    pub fn loopback_addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, Self::default_coordination_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_identity() {
        let identity = ServiceIdentity::default();
        assert_eq!(identity.port(), 8642);
        assert!(identity.coordination_dir().ends_with("scriptsync"));
    }

    #[test]
    fn well_known_paths() {
        let identity = ServiceIdentity::new(9000, "/tmp/coord");
        assert_eq!(identity.marker_path(), PathBuf::from("/tmp/coord/port"));
        assert_eq!(identity.spool_dir(), PathBuf::from("/tmp/coord/spool"));
        assert_eq!(
            ServiceIdentity::loopback_addr(9000).to_string(),
            "127.0.0.1:9000"
        );
    }
}
