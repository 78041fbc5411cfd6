//! Core of scriptsync.
//!
//! A [`BroadcastService`] exposes one WebSocket endpoint per machine that
//! pushes script changes to connected listeners. Any number of host
//! processes may run at once: the [`Host`] elects one owner to run the
//! service, and every other process relays its changes to the owner through
//! the spool directory. A [`Synchronizer`] turns file changes into
//! `onchange` messages and routes them either way.

pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod notice;
pub mod service;
pub mod setup;
pub mod state;
pub mod sync;

pub use config::Config;
pub use error::DaemonError;
pub use handler::{HandlerId, HandlerRegistry, MessageHandler, MessageOrigin};
pub use host::{activate, activate_async, Host};
pub use notice::{LogNotices, Notice, NoticeSink, Severity};
pub use service::{BroadcastService, ServiceSettings, ServiceStatus, DEFAULT_HEARTBEAT};
pub use state::ListenerState;
pub use sync::{Delivery, Route, Synchronizer};
