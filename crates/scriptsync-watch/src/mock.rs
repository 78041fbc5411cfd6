//! Mock change source for testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use scriptsync_types::ChangeEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::WatchError;
use crate::ChangeSource;

/// Change source driven by hand.
///
/// Returns a `mpsc::Sender<ChangeEvent>` that tests use to inject events.
/// When `start()` is called, it spawns a task that forwards injected events
/// to the synchronizer until the source is shut down.
pub struct ManualSource {
    feed_rx: Option<mpsc::Receiver<ChangeEvent>>,
    forwarder: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ManualSource {
    /// Create a new manual source and a sender for injecting events.
    pub fn new() -> (Self, mpsc::Sender<ChangeEvent>) {
        let (feed_tx, feed_rx) = mpsc::channel(1024);
        let source = Self {
            feed_rx: Some(feed_rx),
            forwarder: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        (source, feed_tx)
    }

    /// A flag that flips once the source has been shut down.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }
}

#[async_trait]
impl ChangeSource for ManualSource {
    async fn start(&mut self, tx: mpsc::Sender<ChangeEvent>) -> Result<(), WatchError> {
        let mut feed_rx = self.feed_rx.take().ok_or(WatchError::AlreadyStarted)?;
        let shutdown = self.shutdown.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = feed_rx.recv().await {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), WatchError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        Ok(())
    }
}
