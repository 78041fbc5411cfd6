//! Shared types for scriptsync.
//!
//! This crate contains the types shared across the scriptsync workspace:
//! the JSON wire message pushed to listeners, the owner/follower process
//! role, and the file-change events fed to the synchronizer.

pub mod event;
pub mod message;
pub mod role;

pub use event::{file_uri, ChangeEvent};
pub use message::{Message, ScriptChange, ACTION_HELLO, ACTION_ONCHANGE};
pub use role::ProcessRole;
