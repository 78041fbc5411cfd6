//! Turns script changes into `onchange` messages and routes them.
//!
//! When this process owns the broadcast service the message goes straight
//! to the listeners. Otherwise it is dropped into the relay spool for the
//! owner to pick up.

use std::sync::Arc;

use scriptsync_relay::Spool;
use scriptsync_types::{ChangeEvent, Message, ScriptChange};
use scriptsync_watch::ChangeSource;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::DaemonError;
use crate::handler::{HandlerId, MessageOrigin};
use crate::notice::{Notice, NoticeSink};
use crate::service::BroadcastService;

const CHANGE_CAPACITY: usize = 64;

/// How a message left this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Sent by our own broadcast service.
    Broadcast,
    /// Written to the spool for the owning process.
    Relayed,
}

/// Routes messages to the local service or the relay spool.
#[derive(Clone)]
pub struct Delivery {
    service: Arc<BroadcastService>,
    spool: Spool,
    notices: Arc<dyn NoticeSink>,
}

impl Delivery {
    pub fn new(service: Arc<BroadcastService>, notices: Arc<dyn NoticeSink>) -> Self {
        let spool = service.settings().spool();
        Self {
            service,
            spool,
            notices,
        }
    }

    pub fn service(&self) -> &Arc<BroadcastService> {
        &self.service
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Broadcast `message` if we own the service, relay it otherwise.
    pub async fn deliver(&self, message: Message) -> Result<Route, DaemonError> {
        if self.service.is_running() && self.service.broadcast(message.clone()).await {
            return Ok(Route::Broadcast);
        }
        let path = self.spool.relay(&message).await?;
        trace!(path = %path.display(), "relayed");
        Ok(Route::Relayed)
    }

    /// Read the changed script and deliver it as an `onchange` message.
    ///
    /// Events for anything but a regular file on disk (virtual resources,
    /// directories, files deleted before we got to them) are ignored and
    /// yield `None`.
    pub async fn on_change(&self, event: &ChangeEvent) -> Result<Option<Route>, DaemonError> {
        let Some(path) = event.file_path() else {
            trace!(uri = %event.uri, "ignoring non-file change");
            return Ok(None);
        };
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "changed script vanished");
                return Ok(None);
            }
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| DaemonError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let script = String::from_utf8_lossy(&bytes);
        let message = Message::on_change(&ScriptChange::new(script, event.uri.clone()));
        let route = self.deliver(message).await?;
        debug!(uri = %event.uri, route = ?route, "delivered change");
        Ok(Some(route))
    }

    /// Deliver a change, reporting failures as notices instead of errors.
    async fn on_change_reported(&self, event: &ChangeEvent) {
        if let Err(e) = self.on_change(event).await {
            warn!(uri = %event.uri, error = %e, "failed to deliver change");
            self.notices.notify(Notice::DeliveryFailed {
                reason: e.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("spool", &self.spool)
            .finish_non_exhaustive()
    }
}

/// Watches one change source and delivers every change it reports.
///
/// Closing the synchronizer stops watching but leaves the broadcast service
/// running; other synchronizers may share it.
pub struct Synchronizer {
    delivery: Delivery,
    source: Option<Box<dyn ChangeSource>>,
    pump: Option<JoinHandle<()>>,
    handler: Option<HandlerId>,
}

impl Synchronizer {
    pub fn new(delivery: Delivery) -> Self {
        let handler = delivery
            .service()
            .add_message_handler(|origin: MessageOrigin, message: &Message| {
                trace!(origin = ?origin, action = %message.action, "message seen by synchronizer");
            });
        Self {
            delivery,
            source: None,
            pump: None,
            handler: Some(handler),
        }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn is_watching(&self) -> bool {
        self.source.is_some()
    }

    /// Start delivering changes from `source`.
    pub async fn watch(&mut self, source: Box<dyn ChangeSource>) -> Result<(), DaemonError> {
        self.change_target_script(source).await
    }

    /// Replace the current change source.
    ///
    /// The old source is shut down before the new one starts, so no event
    /// from it is delivered afterwards. The broadcast service and its
    /// listeners are untouched.
    pub async fn change_target_script(
        &mut self,
        mut source: Box<dyn ChangeSource>,
    ) -> Result<(), DaemonError> {
        self.unwatch().await;

        let (tx, mut rx) = mpsc::channel(CHANGE_CAPACITY);
        source.start(tx).await?;

        let delivery = self.delivery.clone();
        self.pump = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                delivery.on_change_reported(&event).await;
            }
        }));
        self.source = Some(source);
        Ok(())
    }

    /// Deliver a message that did not come from the change source.
    pub async fn deliver(&self, message: Message) -> Result<Route, DaemonError> {
        self.delivery.deliver(message).await
    }

    /// Stop watching and unregister from the service.
    pub async fn close(&mut self) {
        self.unwatch().await;
        if let Some(id) = self.handler.take() {
            self.delivery.service().remove_message_handler(id);
        }
    }

    async fn unwatch(&mut self) {
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.shutdown().await {
                debug!(error = %e, "failed to shut down change source");
            }
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use scriptsync_registry::ServiceIdentity;
    use scriptsync_types::file_uri;

    use super::*;
    use crate::notice::LogNotices;
    use crate::service::ServiceSettings;

    fn delivery(dir: &Path) -> Delivery {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut settings = ServiceSettings::new(ServiceIdentity::new(port, dir));
        settings.relay_ttl = Duration::from_secs(60);
        let service = Arc::new(BroadcastService::new(settings, Arc::new(LogNotices)));
        Delivery::new(service, Arc::new(LogNotices))
    }

    #[tokio::test]
    async fn stopped_service_relays() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = delivery(dir.path());

        let route = delivery.deliver(Message::hello()).await.unwrap();
        assert_eq!(route, Route::Relayed);
        assert_eq!(delivery.spool().backlog().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn running_service_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = delivery(dir.path());
        delivery.service().start().unwrap();

        let route = delivery.deliver(Message::hello()).await.unwrap();
        assert_eq!(route, Route::Broadcast);
        delivery.service().stop().await;
    }

    #[tokio::test]
    async fn non_file_changes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = delivery(dir.path());

        let virtual_event = ChangeEvent::virtual_resource("untitled:Untitled-1");
        assert_eq!(delivery.on_change(&virtual_event).await.unwrap(), None);

        let directory = ChangeEvent::from_path(dir.path());
        assert_eq!(delivery.on_change(&directory).await.unwrap(), None);

        let missing = ChangeEvent::from_path(dir.path().join("gone.user.js"));
        assert_eq!(delivery.on_change(&missing).await.unwrap(), None);

        assert!(delivery.spool().backlog().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_change_is_relayed_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = delivery(dir.path());
        let script = dir.path().join("x.user.js");
        std::fs::write(&script, "console.log(1)").unwrap();

        let route = delivery
            .on_change(&ChangeEvent::from_path(&script))
            .await
            .unwrap();
        assert_eq!(route, Some(Route::Relayed));

        let backlog = delivery.spool().backlog().await.unwrap();
        let message = scriptsync_relay::read_spool_file(&backlog[0])
            .await
            .unwrap()
            .unwrap();
        let change = message.script_change().unwrap();
        assert_eq!(change.script, "console.log(1)");
        assert_eq!(change.uri, file_uri(&script));
    }

    #[tokio::test]
    async fn close_unregisters_but_leaves_service_running() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = delivery(dir.path());
        let service = Arc::clone(delivery.service());
        service.start().unwrap();

        let mut sync = Synchronizer::new(delivery);
        assert_eq!(service.handler_count(), 1);
        sync.close().await;
        assert_eq!(service.handler_count(), 0);
        assert!(service.is_running());
        service.stop().await;
    }
}
