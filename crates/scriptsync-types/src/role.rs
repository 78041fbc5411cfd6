//! Process role in the single-endpoint election.

use serde::{Deserialize, Serialize};

/// Which side of the election this process is on.
///
/// Exactly one process per machine and service identity is the `Owner`
/// (holds the listening endpoint); every other process is a `Follower` and
/// hands its messages to the owner through the relay spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessRole {
    Owner,
    Follower,
}

impl ProcessRole {
    /// Whether this process broadcasts directly.
    pub fn is_owner(self) -> bool {
        self == Self::Owner
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "Owner"),
            Self::Follower => write!(f, "Follower"),
        }
    }
}
