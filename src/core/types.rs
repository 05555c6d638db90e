use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for connection operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Close code sent when the driver goes offline on purpose.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code the server uses when it rejects the bearer token.
pub const CLOSE_AUTH_REJECTED: u16 = 4001;
/// Close code the server uses when the driver opened a second session elsewhere.
pub const CLOSE_DUPLICATE_SESSION: u16 = 4003;

/// Canonical error surface for the realtime link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("No authentication token found")]
    MissingToken,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Actor error: {0}")]
    ActorError(String),

    #[error(transparent)]
    Location(#[from] crate::location::LocationError),
}

/// Lifecycle of the single realtime socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
}

/// How a socket close is handled once classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Token rejected: try one refresh, then reconnect or give up.
    RefreshCredentials,
    /// Another device holds the session; never retried.
    DuplicateSession,
    /// Anything else, including plain network loss.
    Reconnect,
}

impl CloseDisposition {
    pub fn classify(code: Option<u16>) -> Self {
        match code {
            Some(CLOSE_AUTH_REJECTED) => CloseDisposition::RefreshCredentials,
            Some(CLOSE_DUPLICATE_SESSION) => CloseDisposition::DuplicateSession,
            _ => CloseDisposition::Reconnect,
        }
    }
}

/// Basic connection statistics snapshot.
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub uptime: Duration,
    pub messages_received: u64,
    pub frames_sent: u64,
    pub reconnects: u64,
    pub last_message_age: Duration,
    pub p50_heartbeat_rtt_us: u64,
    pub p99_heartbeat_rtt_us: u64,
    pub heartbeat_samples: u64,
}

/// Abstract reconnect policy.
pub trait ReconnectStrategy: Send + Sync + 'static {
    /// Delay before the next attempt; advances the attempt counter.
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
    fn should_retry(&self) -> bool;
    fn attempts(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_map_to_dispositions() {
        assert_eq!(
            CloseDisposition::classify(Some(4001)),
            CloseDisposition::RefreshCredentials
        );
        assert_eq!(
            CloseDisposition::classify(Some(4003)),
            CloseDisposition::DuplicateSession
        );
        assert_eq!(
            CloseDisposition::classify(Some(1006)),
            CloseDisposition::Reconnect
        );
        assert_eq!(CloseDisposition::classify(None), CloseDisposition::Reconnect);
    }
}
