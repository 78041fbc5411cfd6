//! Endpoint election and registry for scriptsync.
//!
//! Several host processes on one machine may run the notifier at once, but
//! only one of them may expose the broadcast endpoint. This crate decides
//! which one, using a well-known coordination directory:
//!
//! - [`PortMarker`] records the port the current owner listens on.
//! - [`probe`] tells a live marker from a stale one by trying to bind.
//! - [`elect`] combines both into an owner/follower decision.

pub mod election;
pub mod error;
pub mod identity;
pub mod marker;

pub use election::{claim, elect, probe, Claim, Election, PortStatus};
pub use error::RegistryError;
pub use identity::{ServiceIdentity, DEFAULT_PORT, MARKER_FILE_NAME, SPOOL_DIR_NAME};
pub use marker::PortMarker;
