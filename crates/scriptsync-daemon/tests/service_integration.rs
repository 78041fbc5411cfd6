//! Integration tests: several hosts sharing one coordination directory, with
//! real WebSocket listeners on loopback.

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scriptsync_daemon::{
    activate_async, BroadcastService, Host, LogNotices, MessageOrigin, Notice, NoticeSink, Route, ServiceSettings,
    ServiceStatus,
};
use scriptsync_protocol::{FrameReceiver, FrameSender, Incoming, ListenerConnection};
use scriptsync_registry::{PortMarker, ServiceIdentity};
use scriptsync_relay::Spool;
use scriptsync_types::{file_uri, ChangeEvent, Message, ProcessRole, ScriptChange};
use scriptsync_watch::mock::ManualSource;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn settings(dir: &Path, port: u16) -> ServiceSettings {
    ServiceSettings::new(ServiceIdentity::new(port, dir))
}

/// Collects notices for assertions.
#[derive(Default)]
struct RecordingNotices {
    seen: Mutex<Vec<Notice>>,
}

impl RecordingNotices {
    fn seen(&self) -> Vec<Notice> {
        self.seen.lock().unwrap().clone()
    }
}

impl NoticeSink for RecordingNotices {
    fn notify(&self, notice: Notice) {
        self.seen.lock().unwrap().push(notice);
    }
}

async fn wait_for_status(
    rx: &mut watch::Receiver<ServiceStatus>,
    timeout: Duration,
    pred: impl Fn(&ServiceStatus) -> bool,
) -> Result<ServiceStatus, &'static str> {
    tokio::time::timeout(timeout, async {
        loop {
            {
                let status = rx.borrow_and_update().clone();
                if pred(&status) {
                    return Ok(status);
                }
            }
            if rx.changed().await.is_err() {
                return Err("watch closed");
            }
        }
    })
    .await
    .map_err(|_| "timeout")?
}

/// Connect a listener and consume the greeting.
async fn connect_listener(port: u16) -> (FrameSender, FrameReceiver) {
    let conn = ListenerConnection::connect(ServiceIdentity::loopback_addr(port))
        .await
        .unwrap();
    let (tx, mut rx) = conn.split();
    let hello = tokio::time::timeout(WAIT, rx.recv_message())
        .await
        .expect("greeting should arrive")
        .unwrap()
        .unwrap();
    assert_eq!(hello, Message::hello());
    (tx, rx)
}

async fn next_text(rx: &mut FrameReceiver) -> String {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await.unwrap() {
                Some(Incoming::Text(text)) => return text,
                Some(_) => continue,
                None => panic!("listener closed"),
            }
        }
    })
    .await
    .expect("message should arrive")
}

async fn wait_until_empty(spool: &Spool) {
    tokio::time::timeout(WAIT, async {
        while !spool.backlog().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("spool should drain");
}

#[tokio::test]
async fn first_host_owns_second_follows() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let notices = Arc::new(RecordingNotices::default());

    let owner = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    let follower = Host::start(settings(dir.path(), port), None, notices.clone());

    assert_eq!(owner.role(), ProcessRole::Owner);
    assert_eq!(owner.service().port(), Some(port));
    assert_eq!(follower.role(), ProcessRole::Follower);
    assert!(!follower.service().is_running());
    assert!(notices.seen().contains(&Notice::Following { port }));

    let marker = PortMarker::new(ServiceIdentity::new(port, dir.path()).marker_path());
    assert_eq!(marker.read().unwrap(), Some(port));

    follower.shutdown().await;
    owner.shutdown().await;
    assert_eq!(marker.read().unwrap(), None);
}

#[tokio::test]
async fn listener_is_greeted_and_counted() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let notices = Arc::new(RecordingNotices::default());
    let host = Host::start(settings(dir.path(), port), None, notices.clone());
    let mut status = host.service().status_receiver();

    let (tx, _rx) = connect_listener(port).await;
    wait_for_status(&mut status, WAIT, |s| s.listeners == 1)
        .await
        .unwrap();
    assert_eq!(host.service().listener_count(), 1);
    assert!(notices
        .seen()
        .iter()
        .any(|n| matches!(n, Notice::ListenerConnected { port: p, .. } if *p == port)));

    tx.close().await.unwrap();
    wait_for_status(&mut status, WAIT, |s| s.listeners == 0)
        .await
        .unwrap();
    host.shutdown().await;
}

#[tokio::test]
async fn follower_change_reaches_listener_exactly_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let owner = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    let mut follower = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    assert_eq!(follower.role(), ProcessRole::Follower);

    let (_tx, mut rx) = connect_listener(port).await;

    let (source, feed) = ManualSource::new();
    follower.watch(Box::new(source)).await.unwrap();

    let script = dir.path().join("x.user.js");
    std::fs::write(&script, "console.log(1)").unwrap();
    feed.send(ChangeEvent::from_path(&script)).await.unwrap();

    let text = next_text(&mut rx).await;
    let expected = format!(
        r#"{{"action":"onchange","data":{{"script":"console.log(1)","uri":"{}"}}}}"#,
        file_uri(&script)
    );
    assert_eq!(text, expected);

    // Consumed and deleted, and not delivered a second time.
    wait_until_empty(&owner.service().settings().spool()).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv_message())
            .await
            .is_err(),
        "relayed message must be broadcast once"
    );

    follower.shutdown().await;
    owner.shutdown().await;
}

#[tokio::test]
async fn relayed_payload_arrives_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let owner = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let follower = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    assert_eq!(owner.role(), ProcessRole::Owner);
    assert_eq!(follower.role(), ProcessRole::Follower);

    let (_tx, mut rx) = connect_listener(port).await;

    let message = Message::on_change(&ScriptChange::new(
        "console.log(1)",
        "file:///tmp/x.user.js",
    ));
    assert_eq!(follower.deliver(message).await.unwrap(), Route::Relayed);

    assert_eq!(
        next_text(&mut rx).await,
        r#"{"action":"onchange","data":{"script":"console.log(1)","uri":"file:///tmp/x.user.js"}}"#
    );
    wait_until_empty(&owner.service().settings().spool()).await;

    follower.shutdown().await;
    owner.shutdown().await;
}

#[tokio::test]
async fn owner_change_is_broadcast_directly() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut owner = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));

    let (_tx1, mut rx1) = connect_listener(port).await;
    let (_tx2, mut rx2) = connect_listener(port).await;

    let (source, feed) = ManualSource::new();
    owner.watch(Box::new(source)).await.unwrap();

    let script = dir.path().join("both.user.js");
    std::fs::write(&script, "// both").unwrap();
    feed.send(ChangeEvent::from_path(&script)).await.unwrap();

    for rx in [&mut rx1, &mut rx2] {
        let message = rx.recv_message().await.unwrap().unwrap();
        let change = message.script_change().unwrap();
        assert_eq!(change.script, "// both");
        assert_eq!(change.uri, file_uri(&script));
    }
    assert!(owner
        .service()
        .settings()
        .spool()
        .backlog()
        .await
        .unwrap()
        .is_empty());

    owner.shutdown().await;
}

#[tokio::test]
async fn broadcast_without_listeners_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::start(settings(dir.path(), free_port()), None, Arc::new(LogNotices));
    assert_eq!(host.service().listener_count(), 0);

    let route = host.deliver(Message::hello()).await.unwrap();
    assert_eq!(route, Route::Broadcast);
    host.shutdown().await;
}

#[tokio::test]
async fn changing_target_keeps_role_and_listeners() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut host = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    let mut status = host.service().status_receiver();

    let (_tx, mut rx) = connect_listener(port).await;
    wait_for_status(&mut status, WAIT, |s| s.listeners == 1)
        .await
        .unwrap();

    let (old_source, old_feed) = ManualSource::new();
    let old_flag = old_source.shutdown_flag();
    host.watch(Box::new(old_source)).await.unwrap();

    let (new_source, new_feed) = ManualSource::new();
    host.change_target_script(Box::new(new_source)).await.unwrap();
    assert!(old_flag.load(Ordering::SeqCst));
    assert_eq!(host.role(), ProcessRole::Owner);
    assert_eq!(host.service().listener_count(), 1);

    let stale = dir.path().join("old.user.js");
    std::fs::write(&stale, "// old").unwrap();
    let _ = old_feed.send(ChangeEvent::from_path(&stale)).await;

    let fresh = dir.path().join("new.user.js");
    std::fs::write(&fresh, "// new").unwrap();
    new_feed.send(ChangeEvent::from_path(&fresh)).await.unwrap();

    let message = rx.recv_message().await.unwrap().unwrap();
    assert_eq!(message.script_change().unwrap().script, "// new");

    host.shutdown().await;
}

#[tokio::test]
async fn stale_marker_is_taken_over() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let marker = PortMarker::new(ServiceIdentity::new(port, dir.path()).marker_path());
    // A crashed owner left a marker behind for a port nobody holds.
    marker.write(free_port()).unwrap();

    let host = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    assert_eq!(host.role(), ProcessRole::Owner);
    assert_eq!(marker.read().unwrap(), Some(port));
    host.shutdown().await;
}

#[tokio::test]
async fn follower_is_promoted_when_owner_goes_away() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let owner = Host::start(settings(dir.path(), port), None, Arc::new(LogNotices));
    let follower = Host::start(
        settings(dir.path(), port),
        Some(Duration::from_millis(100)),
        Arc::new(LogNotices),
    );
    assert_eq!(follower.role(), ProcessRole::Follower);
    let mut status = follower.service().status_receiver();

    owner.shutdown().await;

    wait_for_status(&mut status, WAIT, ServiceStatus::is_running)
        .await
        .unwrap();
    assert_eq!(follower.role(), ProcessRole::Owner);
    connect_listener(port).await;

    follower.shutdown().await;
}

#[tokio::test]
async fn spool_backlog_is_drained_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let settings = settings(dir.path(), port);
    let spool = settings.spool();
    spool
        .relay(&Message::new("custom", Some(serde_json::json!({ "n": 1 }))))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let service = BroadcastService::new(settings, Arc::new(LogNotices));
    let recorder = seen.clone();
    service.add_message_handler(move |origin: MessageOrigin, message: &Message| {
        recorder.lock().unwrap().push((origin, message.action.clone()));
    });
    service.start().unwrap();

    wait_until_empty(&spool).await;
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[(MessageOrigin::Relay, "custom".to_string())]
    );
    service.stop().await;
}

#[tokio::test]
async fn inbound_messages_reach_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let service = BroadcastService::new(settings(dir.path(), port), Arc::new(LogNotices));
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    service.add_message_handler(move |origin: MessageOrigin, message: &Message| {
        let _ = seen_tx.send((origin, message.clone()));
    });
    service.start().unwrap();

    let (mut tx, _rx) = connect_listener(port).await;
    tx.send(&Message::new("ack", None)).await.unwrap();

    let (origin, message) = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(origin, MessageOrigin::Listener(_)));
    assert_eq!(message.action, "ack");
    service.stop().await;
}

#[tokio::test]
async fn heartbeat_pings_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut settings = settings(dir.path(), port);
    settings.heartbeat = Duration::from_millis(100);
    let service = BroadcastService::new(settings, Arc::new(LogNotices));
    service.start().unwrap();

    let (_tx, mut rx) = connect_listener(port).await;
    let frame = tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, Some(Incoming::Ping));
    service.stop().await;
}

#[tokio::test]
async fn stop_closes_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let service = BroadcastService::new(settings(dir.path(), port), Arc::new(LogNotices));
    service.start().unwrap();

    let (_tx, mut rx) = connect_listener(port).await;
    service.stop().await;

    let end = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(Some(Incoming::Text(_))) | Ok(Some(Incoming::Ping | Incoming::Pong)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "listener should see the connection close");
    assert!(ListenerConnection::connect(ServiceIdentity::loopback_addr(port))
        .await
        .is_err());
}

#[tokio::test]
async fn stop_drops_connections_still_in_handshake() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let service = BroadcastService::new(settings(dir.path(), port), Arc::new(LogNotices));
    service.start().unwrap();

    // Accepted, but the client has not sent its upgrade request yet.
    let mut stream = tokio::net::TcpStream::connect(ServiceIdentity::loopback_addr(port))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    service.stop().await;
    assert!(!service.is_running());

    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: 127.0.0.1:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    let _ = stream.write_all(request.as_bytes()).await;

    let mut reply = Vec::new();
    let read = tokio::time::timeout(WAIT, stream.read_to_end(&mut reply))
        .await
        .expect("stopped service should close the connection");
    if read.is_ok() {
        let reply = String::from_utf8_lossy(&reply);
        assert!(
            !reply.contains(" 101 "),
            "handshake completed after stop: {reply}"
        );
    }
}

#[tokio::test(flavor = "current_thread")]
async fn async_activation_follows_then_takes_over() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let owner = BroadcastService::new(settings(dir.path(), port), Arc::new(LogNotices));
    owner.start().unwrap();
    let follower = BroadcastService::new(settings(dir.path(), port), Arc::new(LogNotices));

    assert_eq!(
        activate_async(&follower).await.unwrap(),
        ProcessRole::Follower
    );
    assert!(!follower.is_running());

    owner.stop().await;
    assert_eq!(activate_async(&follower).await.unwrap(), ProcessRole::Owner);
    assert_eq!(follower.port(), Some(port));
    connect_listener(port).await;
    follower.stop().await;
}
