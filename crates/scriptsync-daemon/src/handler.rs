//! Inbound message handlers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use scriptsync_types::Message;

/// Where a message handed to a [`MessageHandler`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Sent by a connected listener.
    Listener(SocketAddr),
    /// Picked up from the spool, written by a follower process.
    Relay,
}

/// Observes messages arriving at the broadcast service.
///
/// Called on the service task, so implementations must return quickly.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, origin: MessageOrigin, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(MessageOrigin, &Message) + Send + Sync,
{
    fn handle(&self, origin: MessageOrigin, message: &Message) {
        self(origin, message);
    }
}

/// Identifies a registered handler for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Handlers {
    next: u64,
    entries: Vec<(HandlerId, Arc<dyn MessageHandler>)>,
}

/// Shared, ordered set of message handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Mutex<Handlers>>,
}

impl HandlerRegistry {
    pub fn add(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let mut handlers = self.lock();
        let id = HandlerId(handlers.next);
        handlers.next += 1;
        handlers.entries.push((id, handler));
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.entries.len();
        handlers.entries.retain(|(existing, _)| *existing != id);
        handlers.entries.len() != before
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler in registration order.
    pub fn dispatch(&self, origin: MessageOrigin, message: &Message) {
        // Snapshot first so a handler may add or remove handlers.
        let snapshot: Vec<Arc<dyn MessageHandler>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler.handle(origin, message);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Handlers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}
