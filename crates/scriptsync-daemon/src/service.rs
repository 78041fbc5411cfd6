//! The broadcast service.
//!
//! One task owns the listening socket and every listener connection. The
//! public [`BroadcastService`] handle talks to it over a command channel, so
//! all listener bookkeeping happens on a single task and needs no locking.
//!
//! Each listener gets a reader task and a writer task fed by a small bounded
//! outbox. Broadcasts and heartbeats use `try_send`, so one slow listener
//! never holds up the others.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use scriptsync_protocol::wire::{decode_message, encode_message};
use scriptsync_protocol::{
    FrameReceiver, FrameSender, Incoming, ListenerConnection, PendingConnection, WsTransport,
};
use scriptsync_registry::{claim, Claim, PortMarker, ServiceIdentity};
use scriptsync_relay::{read_spool_file, remove_spool_file, Spool, SpoolWatcher, DEFAULT_TTL};
use scriptsync_types::Message;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::DaemonError;
use crate::handler::{HandlerId, HandlerRegistry, MessageHandler, MessageOrigin};
use crate::notice::{Notice, NoticeSink};
use crate::state::ListenerState;

/// Interval between protocol-level pings to every listener.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

const OUTBOX_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// A connection that has not finished the WebSocket handshake by then is dropped.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the service needs to know about where and how to run.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub identity: ServiceIdentity,
    pub heartbeat: Duration,
    pub relay_ttl: Duration,
}

impl ServiceSettings {
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            heartbeat: DEFAULT_HEARTBEAT,
            relay_ttl: DEFAULT_TTL,
        }
    }

    pub fn spool(&self) -> Spool {
        Spool::new(self.identity.spool_dir(), self.relay_ttl)
    }
}

/// Snapshot published on every change, for status queries and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    /// The bound port, or `None` while stopped.
    pub port: Option<u16>,
    pub listeners: usize,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        self.port.is_some()
    }
}

enum Command {
    Broadcast(Message),
    Stop(oneshot::Sender<()>),
}

struct Running {
    port: u16,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Handle on the process-wide broadcast endpoint.
///
/// Starting is idempotent and so is stopping. While stopped, broadcasts are
/// silently dropped; callers that need delivery regardless go through the
/// synchronizer, which falls back to the spool.
pub struct BroadcastService {
    settings: ServiceSettings,
    notices: Arc<dyn NoticeSink>,
    handlers: HandlerRegistry,
    running: Mutex<Option<Running>>,
    status: Arc<watch::Sender<ServiceStatus>>,
}

impl BroadcastService {
    pub fn new(settings: ServiceSettings, notices: Arc<dyn NoticeSink>) -> Self {
        let (status, _) = watch::channel(ServiceStatus::default());
        Self {
            settings,
            notices,
            handlers: HandlerRegistry::default(),
            running: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Bind the configured port and start serving.
    ///
    /// Returns the bound port. Fails with [`DaemonError::AddrInUse`] if
    /// another process owns the port. Must be called from within a Tokio
    /// runtime.
    pub fn start(&self) -> Result<u16, DaemonError> {
        let mut running = self.lock_running();
        if let Some(current) = running.as_ref() {
            return Ok(current.port);
        }
        match claim(&self.settings.identity)? {
            Claim::Owned(listener) => self.launch(&mut running, listener),
            Claim::Taken => Err(DaemonError::AddrInUse {
                port: self.settings.identity.port(),
            }),
        }
    }

    /// Start serving on a listener that was already bound, typically won in
    /// an election. If the service is already running the listener is
    /// dropped and the current port returned.
    pub fn start_with(&self, listener: std::net::TcpListener) -> Result<u16, DaemonError> {
        let mut running = self.lock_running();
        if let Some(current) = running.as_ref() {
            return Ok(current.port);
        }
        self.launch(&mut running, listener)
    }

    fn launch(
        &self,
        running: &mut Option<Running>,
        listener: std::net::TcpListener,
    ) -> Result<u16, DaemonError> {
        let transport = WsTransport::from_std(listener)?;
        let port = transport.local_addr()?.port();

        let spool = self.settings.spool();
        let spool_watcher = match SpoolWatcher::watch(spool.dir()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "relay spool unavailable, followers cannot reach us");
                None
            }
        };

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(COMMAND_CAPACITY);
        let service_loop = ServiceLoop {
            port,
            transport,
            commands: command_rx,
            events_tx,
            events_rx,
            upgrades: JoinSet::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            heartbeat: self.settings.heartbeat,
            spool,
            spool_watcher,
            marker: PortMarker::new(self.settings.identity.marker_path()),
            notices: Arc::clone(&self.notices),
            handlers: self.handlers.clone(),
            status: Arc::clone(&self.status),
        };

        self.status.send_replace(ServiceStatus {
            port: Some(port),
            listeners: 0,
        });
        let task = tokio::spawn(service_loop.run());
        *running = Some(Running {
            port,
            commands,
            task,
        });

        info!(port, "broadcast service started");
        self.notices.notify(Notice::ServiceStarted { port });
        Ok(port)
    }

    /// Send `message` to every open listener.
    ///
    /// Returns `false` if the service is not running, in which case nothing
    /// was sent. Zero listeners is not an error.
    pub async fn broadcast(&self, message: Message) -> bool {
        let commands = self.lock_running().as_ref().map(|r| r.commands.clone());
        match commands {
            Some(commands) => commands.send(Command::Broadcast(message)).await.is_ok(),
            None => false,
        }
    }

    /// Close every listener, stop accepting, release the port and remove
    /// the marker if it still names us. Registered handlers are cleared.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        if let Some(running) = running {
            let (ack_tx, ack_rx) = oneshot::channel();
            if running.commands.send(Command::Stop(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            } else {
                // The loop is gone already; clean up after it.
                running.task.abort();
                let marker = PortMarker::new(self.settings.identity.marker_path());
                if let Err(e) = marker.remove_if(running.port) {
                    debug!(error = %e, "failed to remove port marker");
                }
                self.status.send_replace(ServiceStatus::default());
            }
            self.notices.notify(Notice::ServiceStopped { port: running.port });
        }
        self.handlers.clear();
    }

    pub fn port(&self) -> Option<u16> {
        self.lock_running().as_ref().map(|r| r.port)
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.status.borrow().listeners
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    pub fn add_message_handler(&self, handler: impl MessageHandler + 'static) -> HandlerId {
        self.handlers.add(Arc::new(handler))
    }

    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BroadcastService {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.task.abort();
        }
    }
}

impl std::fmt::Debug for BroadcastService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastService")
            .field("settings", &self.settings)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum ListenerEvent {
    Upgraded(ListenerConnection),
    Inbound { id: ListenerId, text: String },
    Closed(ListenerId),
}

enum Outbound {
    Text(String),
    Ping,
    Close,
}

struct Listener {
    remote: SocketAddr,
    state: ListenerState,
    outbox: mpsc::Sender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ServiceLoop {
    port: u16,
    transport: WsTransport,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<ListenerEvent>,
    events_rx: mpsc::Receiver<ListenerEvent>,
    /// Handshakes in flight; aborted on shutdown.
    upgrades: JoinSet<()>,
    listeners: HashMap<ListenerId, Listener>,
    next_listener: u64,
    heartbeat: Duration,
    spool: Spool,
    spool_watcher: Option<SpoolWatcher>,
    marker: PortMarker,
    notices: Arc<dyn NoticeSink>,
    handlers: HandlerRegistry,
    status: Arc<watch::Sender<ServiceStatus>>,
}

impl ServiceLoop {
    async fn run(mut self) {
        self.drain_backlog().await;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = self.transport.accept() => {
                    match result {
                        Ok(pending) => self.spawn_upgrade(pending),
                        Err(e) => debug!(error = %e, "accept error"),
                    }
                }
                Some(_) = self.upgrades.join_next(), if !self.upgrades.is_empty() => {}
                Some(event) = self.events_rx.recv() => {
                    self.handle_listener_event(event);
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Broadcast(message)) => self.broadcast(&message),
                        Some(Command::Stop(ack)) => {
                            self.shutdown().await;
                            let _ = ack.send(());
                            return;
                        }
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.ping_all();
                }
                Some(path) = next_spool_file(&mut self.spool_watcher) => {
                    self.consume_spool_file(&path).await;
                }
            }
        }
    }

    fn spawn_upgrade(&mut self, pending: PendingConnection) {
        let events = self.events_tx.clone();
        self.upgrades.spawn(async move {
            let remote = pending.remote_address();
            match tokio::time::timeout(UPGRADE_TIMEOUT, pending.upgrade()).await {
                Ok(Ok(conn)) => {
                    let _ = events.send(ListenerEvent::Upgraded(conn)).await;
                }
                Ok(Err(e)) => debug!(remote = %remote, error = %e, "websocket upgrade failed"),
                Err(_) => debug!(remote = %remote, "websocket upgrade timed out"),
            }
        });
    }

    fn handle_listener_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Upgraded(conn) => self.add_listener(conn),
            ListenerEvent::Inbound { id, text } => {
                let Some(listener) = self.listeners.get(&id) else {
                    return;
                };
                match decode_message(&text) {
                    Ok(message) => {
                        trace!(listener = %id, action = %message.action, "inbound message");
                        self.handlers
                            .dispatch(MessageOrigin::Listener(listener.remote), &message);
                    }
                    Err(e) => debug!(listener = %id, error = %e, "ignoring malformed inbound frame"),
                }
            }
            ListenerEvent::Closed(id) => self.remove_listener(id),
        }
    }

    fn add_listener(&mut self, conn: ListenerConnection) {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;

        let remote = conn.remote_address();
        let (sender, receiver) = conn.split();
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let writer = tokio::spawn(write_frames(id, sender, outbox_rx, self.events_tx.clone()));
        let reader = tokio::spawn(read_frames(id, receiver, self.events_tx.clone()));

        let mut listener = Listener {
            remote,
            state: ListenerState::Connecting,
            outbox,
            reader,
            writer,
        };
        listener.state = listener.state.on_upgraded();

        match encode_message(&Message::hello()) {
            Ok(hello) => {
                let _ = listener.outbox.try_send(Outbound::Text(hello));
            }
            Err(e) => warn!(error = %e, "failed to encode greeting"),
        }

        debug!(listener = %id, remote = %remote, "listener connected");
        self.listeners.insert(id, listener);
        self.notices.notify(Notice::ListenerConnected {
            remote,
            port: self.port,
        });
        self.publish_status();
    }

    fn remove_listener(&mut self, id: ListenerId) {
        let Some(mut listener) = self.listeners.remove(&id) else {
            return;
        };
        listener.state = listener.state.on_closed();
        listener.reader.abort();
        listener.writer.abort();
        debug!(listener = %id, remote = %listener.remote, state = %listener.state, "listener removed");
        self.notices.notify(Notice::ListenerDisconnected {
            remote: listener.remote,
        });
        self.publish_status();
    }

    fn broadcast(&mut self, message: &Message) {
        if self.listeners.is_empty() {
            trace!(action = %message.action, "no listeners, dropping broadcast");
            return;
        }
        let text = match encode_message(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast");
                return;
            }
        };
        self.fan_out(|| Outbound::Text(text.clone()));
        debug!(action = %message.action, listeners = self.listeners.len(), "broadcast");
    }

    fn ping_all(&mut self) {
        trace!(listeners = self.listeners.len(), "heartbeat");
        self.fan_out(|| Outbound::Ping);
    }

    fn fan_out(&mut self, frame: impl Fn() -> Outbound) {
        let mut gone = Vec::new();
        for (id, listener) in &mut self.listeners {
            if !listener.state.can_send() {
                continue;
            }
            match listener.outbox.try_send(frame()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(listener = %id, "listener backlogged, skipping frame");
                }
                Err(TrySendError::Closed(_)) => {
                    listener.state = listener.state.on_close_requested();
                    gone.push(*id);
                }
            }
        }
        for id in gone {
            self.remove_listener(id);
        }
    }

    /// Clear out what crashed followers left and deliver whatever is still
    /// fresh. Runs once when the service starts.
    async fn drain_backlog(&mut self) {
        if let Err(e) = self.spool.sweep_expired().await {
            debug!(error = %e, "failed to sweep relay spool");
        }
        match self.spool.backlog().await {
            Ok(paths) => {
                for path in paths {
                    self.consume_spool_file(&path).await;
                }
            }
            Err(e) => debug!(error = %e, "failed to list relay spool"),
        }
    }

    async fn consume_spool_file(&mut self, path: &Path) {
        match read_spool_file(path).await {
            Ok(Some(message)) => {
                debug!(path = %path.display(), action = %message.action, "relaying spooled message");
                self.broadcast(&message);
                self.handlers.dispatch(MessageOrigin::Relay, &message);
            }
            // Another event for the same file already consumed it.
            Ok(None) => return,
            Err(e) => warn!(error = %e, "discarding unreadable relay message"),
        }
        if let Err(e) = remove_spool_file(path).await {
            debug!(error = %e, "failed to remove consumed relay message");
        }
    }

    async fn shutdown(&mut self) {
        self.upgrades.shutdown().await;
        for listener in self.listeners.values_mut() {
            listener.state = listener.state.on_close_requested();
            let _ = listener.outbox.try_send(Outbound::Close);
        }
        for (_, listener) in self.listeners.drain() {
            let writer = listener.writer.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, listener.writer).await.is_err() {
                writer.abort();
            }
            listener.reader.abort();
            self.notices.notify(Notice::ListenerDisconnected {
                remote: listener.remote,
            });
        }

        self.spool_watcher = None;
        if let Err(e) = self.marker.remove_if(self.port) {
            debug!(error = %e, "failed to remove port marker");
        }
        self.status.send_replace(ServiceStatus::default());
        info!(port = self.port, "broadcast service stopped");
    }

    fn publish_status(&self) {
        self.status.send_replace(ServiceStatus {
            port: Some(self.port),
            listeners: self.listeners.len(),
        });
    }
}

async fn next_spool_file(watcher: &mut Option<SpoolWatcher>) -> Option<PathBuf> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

async fn write_frames(
    id: ListenerId,
    mut sender: FrameSender,
    mut outbox: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<ListenerEvent>,
) {
    while let Some(frame) = outbox.recv().await {
        let result = match frame {
            Outbound::Text(text) => sender.send_text(text).await,
            Outbound::Ping => sender.ping().await,
            Outbound::Close => {
                if let Err(e) = sender.close().await {
                    trace!(listener = %id, error = %e, "close handshake failed");
                }
                return;
            }
        };
        if let Err(e) = result {
            debug!(listener = %id, error = %e, "send failed");
            let _ = events.send(ListenerEvent::Closed(id)).await;
            return;
        }
    }
}

async fn read_frames(
    id: ListenerId,
    mut receiver: FrameReceiver,
    events: mpsc::Sender<ListenerEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(Some(Incoming::Text(text))) => {
                if events
                    .send(ListenerEvent::Inbound { id, text })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Some(Incoming::Ping | Incoming::Pong)) => {
                trace!(listener = %id, "control frame");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(listener = %id, error = %e, "read failed");
                break;
            }
        }
    }
    let _ = events.send(ListenerEvent::Closed(id)).await;
}
