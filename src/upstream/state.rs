use std::fmt;

/// Connection lifecycle as observed by consumers.
///
/// Owned exclusively by the connection manager; everything else reads it
/// through a watch channel and renders it with `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Connected,
    Disconnected { reason: String },
    Error { message: String },
    PollingFallback,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, ConnectionState::PollingFallback)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Initializing => write!(f, "Initializing..."),
            ConnectionState::Connected => write!(f, "Connected to server"),
            ConnectionState::Disconnected { reason } => {
                write!(f, "Disconnected from server: {reason}")
            }
            ConnectionState::Error { message } => write!(f, "Connection error: {message}"),
            ConnectionState::PollingFallback => write!(f, "Polling for updates"),
        }
    }
}
