//! Host composition: election, service, synchronizer and re-election.

use std::sync::Arc;
use std::time::Duration;

use scriptsync_registry::{elect, Election};
use scriptsync_types::{Message, ProcessRole};
use scriptsync_watch::ChangeSource;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::DaemonError;
use crate::notice::{Notice, NoticeSink};
use crate::service::{BroadcastService, ServiceSettings};
use crate::sync::{Delivery, Route, Synchronizer};

/// Run an election and start the service if this process wins it.
///
/// A process that already runs the service stays the owner.
pub fn activate(service: &BroadcastService) -> Result<ProcessRole, DaemonError> {
    if service.is_running() {
        return Ok(ProcessRole::Owner);
    }
    let election = elect(&service.settings().identity)?;
    adopt(service, election)
}

/// Like [`activate`], but runs the blocking election on the blocking pool.
pub async fn activate_async(service: &BroadcastService) -> Result<ProcessRole, DaemonError> {
    if service.is_running() {
        return Ok(ProcessRole::Owner);
    }
    let identity = service.settings().identity.clone();
    let election = tokio::task::spawn_blocking(move || elect(&identity))
        .await
        .map_err(|e| DaemonError::Other(e.into()))??;
    adopt(service, election)
}

fn adopt(service: &BroadcastService, election: Election) -> Result<ProcessRole, DaemonError> {
    match election {
        Election::Owner { listener, .. } => {
            service.start_with(listener)?;
            Ok(ProcessRole::Owner)
        }
        Election::Follower { .. } => Ok(ProcessRole::Follower),
    }
}

/// One host process: its view of the shared endpoint plus one synchronizer.
pub struct Host {
    service: Arc<BroadcastService>,
    synchronizer: Synchronizer,
    reelection: Option<JoinHandle<()>>,
}

impl Host {
    pub fn from_config(config: &Config, notices: Arc<dyn NoticeSink>) -> Self {
        Self::start(
            config.service.settings(),
            config.service.reelect_interval(),
            notices,
        )
    }

    /// Elect, start the service if we won, and arm periodic re-election.
    ///
    /// Never fails: a process that cannot bind runs as a follower and keeps
    /// relaying through the spool. Must be called from within a Tokio
    /// runtime.
    pub fn start(
        settings: ServiceSettings,
        reelect: Option<Duration>,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        let service = Arc::new(BroadcastService::new(settings, Arc::clone(&notices)));
        let port = service.settings().identity.port();

        match activate(&service) {
            Ok(ProcessRole::Owner) => {}
            Ok(ProcessRole::Follower) => notices.notify(Notice::Following { port }),
            Err(e) => {
                warn!(error = %e, "election failed, running as follower");
                notices.notify(Notice::StartFailed {
                    reason: e.to_string(),
                });
            }
        }

        let synchronizer = Synchronizer::new(Delivery::new(Arc::clone(&service), notices));
        let reelection = reelect.map(|every| spawn_reelection(Arc::clone(&service), every));

        Self {
            service,
            synchronizer,
            reelection,
        }
    }

    /// Owner iff this process currently runs the broadcast service.
    pub fn role(&self) -> ProcessRole {
        if self.service.is_running() {
            ProcessRole::Owner
        } else {
            ProcessRole::Follower
        }
    }

    pub fn service(&self) -> &Arc<BroadcastService> {
        &self.service
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub async fn watch(&mut self, source: Box<dyn ChangeSource>) -> Result<(), DaemonError> {
        self.synchronizer.watch(source).await
    }

    pub async fn change_target_script(
        &mut self,
        source: Box<dyn ChangeSource>,
    ) -> Result<(), DaemonError> {
        self.synchronizer.change_target_script(source).await
    }

    pub async fn deliver(&self, message: Message) -> Result<Route, DaemonError> {
        self.synchronizer.deliver(message).await
    }

    /// Stop re-electing, close the synchronizer and stop the service.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.reelection.take() {
            task.abort();
        }
        self.synchronizer.close().await;
        self.service.stop().await;
        debug!("host shut down");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(task) = self.reelection.take() {
            task.abort();
        }
    }
}

/// Periodically retry the election while we are a follower, so a crashed
/// owner is replaced without waiting for a restart.
fn spawn_reelection(service: Arc<BroadcastService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if service.is_running() {
                continue;
            }
            match activate_async(&service).await {
                Ok(ProcessRole::Owner) => info!("promoted to broadcast owner"),
                Ok(ProcessRole::Follower) => {}
                Err(e) => debug!(error = %e, "re-election failed"),
            }
        }
    })
}
