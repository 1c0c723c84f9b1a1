//! Error taxonomy for the network layer.
//!
//! Only connection and configuration failures are surfaced to callers.
//! Protocol noise from peers (unknown channels, malformed payloads) never
//! becomes an error; it is dropped where it is detected.

/// The underlying pipe failed to open or broke.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,
}

/// Setup mistakes caught before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required metadata: {0}")]
    MissingMetadata(String),
}

/// Why `connect()` did not reach `Connected`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection closed before it opened")]
    Rejected,

    #[error("timed out waiting for the connection to open")]
    Timeout,

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("no acceptor available")]
    NoAcceptor,
}

impl ConnectError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport(_) => "transport",
            Self::Config(_) => "config",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::AlreadyConnected => "already_connected",
            Self::NoAcceptor => "no_acceptor",
        }
    }
}

/// Why an outbound message was not handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error("channel {0} is reserved for the network layer")]
    Reserved(String),

    #[error("failed to serialize payload: {0}")]
    Serialize(String),
}
