//! Listener connection state machine.

/// Lifecycle of one listener connection as seen by the broadcast service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// TCP accepted, WebSocket handshake in progress.
    Connecting,
    /// Handshake complete; receives broadcasts and heartbeats.
    Open,
    /// A close was requested or a send failed.
    Closing,
    /// Gone. Never sent to again.
    Closed,
}

impl ListenerState {
    /// Only open listeners are sent broadcasts and pings.
    pub fn can_send(self) -> bool {
        self == Self::Open
    }

    pub fn on_upgraded(self) -> Self {
        match self {
            Self::Connecting => Self::Open,
            other => other,
        }
    }

    pub fn on_close_requested(self) -> Self {
        match self {
            Self::Connecting | Self::Open => Self::Closing,
            other => other,
        }
    }

    pub fn on_closed(self) -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let state = ListenerState::Connecting;
        assert!(!state.can_send());
        let state = state.on_upgraded();
        assert_eq!(state, ListenerState::Open);
        assert!(state.can_send());
        let state = state.on_close_requested();
        assert_eq!(state, ListenerState::Closing);
        assert!(!state.can_send());
        assert_eq!(state.on_closed(), ListenerState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let state = ListenerState::Closed;
        assert_eq!(state.on_upgraded(), ListenerState::Closed);
        assert_eq!(state.on_close_requested(), ListenerState::Closed);
        assert!(!state.can_send());
    }

    #[test]
    fn closing_listener_never_reopens() {
        assert_eq!(
            ListenerState::Closing.on_upgraded(),
            ListenerState::Closing
        );
    }
}
