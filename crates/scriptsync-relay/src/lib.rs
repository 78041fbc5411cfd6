//! File-based fallback relay for scriptsync.
//!
//! A follower cannot reach listeners directly, so it drops each message as a
//! uniquely named JSON file into a shared spool directory ([`Spool::relay`]).
//! The owner watches that directory ([`SpoolWatcher`]), re-broadcasts each
//! file and deletes it. Files nobody consumes are deleted by their writer
//! once the TTL has passed.

pub mod error;
pub mod spool;
pub mod watcher;

pub use error::RelayError;
pub use spool::{
    is_spool_file, read_spool_file, remove_spool_file, spool_file_name, Spool, DEFAULT_TTL,
    SPOOL_EXTENSION,
};
pub use watcher::SpoolWatcher;
