//! Owner election.
//!
//! The first process to bind the loopback port wins. Everyone else becomes a
//! follower. The marker file only speeds up detection; the bind itself is the
//! arbiter, so two processes racing past an empty marker still end up with
//! exactly one owner.

use std::io::ErrorKind;
use std::net::TcpListener;

use scriptsync_types::ProcessRole;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::identity::ServiceIdentity;
use crate::marker::PortMarker;

/// Result of probing a loopback port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    /// Something is listening there.
    Live,
    /// Nothing is listening; the port could be bound.
    Free,
}

/// Probe a port by binding a throwaway socket to it and releasing it at once.
pub fn probe(port: u16) -> Result<PortStatus, RegistryError> {
    classify_bind(port, TcpListener::bind(ServiceIdentity::loopback_addr(port)))
}

fn classify_bind(
    port: u16,
    bound: std::io::Result<TcpListener>,
) -> Result<PortStatus, RegistryError> {
    match bound {
        Ok(listener) => {
            drop(listener);
            Ok(PortStatus::Free)
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(PortStatus::Live),
        Err(source) => Err(RegistryError::Bind { port, source }),
    }
}

/// Outcome of trying to bind the service port.
#[derive(Debug)]
pub enum Claim {
    /// We bound the port; the marker now points at us.
    Owned(TcpListener),
    /// Another process holds the port.
    Taken,
}

/// Bind the service port and publish the marker on success.
///
/// A marker write failure is logged but does not undo the claim: followers
/// still discover the owner through the bind conflict.
pub fn claim(identity: &ServiceIdentity) -> Result<Claim, RegistryError> {
    let port = identity.port();
    let listener = match TcpListener::bind(ServiceIdentity::loopback_addr(port)) {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            debug!(port, "service port already taken");
            return Ok(Claim::Taken);
        }
        Err(source) => return Err(RegistryError::Bind { port, source }),
    };

    let bound_port = listener
        .local_addr()
        .map_err(|source| RegistryError::Bind { port, source })?
        .port();

    let marker = PortMarker::new(identity.marker_path());
    if let Err(e) = marker.write(bound_port) {
        warn!(error = %e, "failed to publish port marker");
    }
    info!(port = bound_port, "claimed broadcast endpoint");
    Ok(Claim::Owned(listener))
}

/// The role this process ended up with.
#[derive(Debug)]
pub enum Election {
    Owner { listener: TcpListener, port: u16 },
    Follower { port: u16 },
}

impl Election {
    pub fn role(&self) -> ProcessRole {
        match self {
            Self::Owner { .. } => ProcessRole::Owner,
            Self::Follower { .. } => ProcessRole::Follower,
        }
    }

    /// The port the owner listens on.
    pub fn port(&self) -> u16 {
        match self {
            Self::Owner { port, .. } | Self::Follower { port } => *port,
        }
    }
}

/// Decide whether this process owns the broadcast endpoint.
///
/// 1. A marker naming a live port makes us a follower of that port.
/// 2. A marker naming a free port is stale and is deleted.
/// 3. Otherwise we try to bind the service port; losing that race also makes
///    us a follower.
///
/// A marker naming a port we cannot even probe (say, a privileged port) is
/// treated as stale: it cannot be ours, and the service port decides.
pub fn elect(identity: &ServiceIdentity) -> Result<Election, RegistryError> {
    elect_with(identity, probe)
}

fn elect_with(
    identity: &ServiceIdentity,
    probe: impl Fn(u16) -> Result<PortStatus, RegistryError>,
) -> Result<Election, RegistryError> {
    let marker = PortMarker::new(identity.marker_path());

    match marker.read() {
        Ok(Some(port)) => match probe(port) {
            Ok(PortStatus::Live) => {
                debug!(port, "marker points at a live owner");
                return Ok(Election::Follower { port });
            }
            Ok(PortStatus::Free) => {
                debug!(port, "removing stale port marker");
                marker.remove()?;
            }
            Err(e) => {
                debug!(port, error = %e, "cannot probe marker port, removing marker");
                marker.remove()?;
            }
        },
        Ok(None) => {}
        Err(RegistryError::InvalidMarker { contents, .. }) => {
            debug!(contents = %contents.trim(), "removing unreadable port marker");
            marker.remove()?;
        }
        Err(e) => return Err(e),
    }

    match claim(identity)? {
        Claim::Owned(listener) => {
            let port = listener
                .local_addr()
                .map_err(|source| RegistryError::Bind {
                    port: identity.port(),
                    source,
                })?
                .port();
            Ok(Election::Owner { listener, port })
        }
        Claim::Taken => Ok(Election::Follower {
            port: identity.port(),
        }),
    }
}
