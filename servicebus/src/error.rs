//! Error types for the service bus.

use {std::time::Duration, thiserror::Error};

/// Errors that can occur anywhere in the service bus client layer.
#[derive(Error, Debug)]
pub enum ServiceBusError {
    /// Connecting to a broker host failed (network, authentication or TLS),
    /// or an operation was attempted on a link that is not connected.
    #[error("connection error: {0}")]
    Connection(String),

    /// A one-way publish could not be delivered to the broker.
    #[error("send error: {0}")]
    Send(String),

    /// An RPC call exceeded its deadline without a matching reply.
    #[error("RPC call timeout after {0:?}")]
    Timeout(Duration),

    /// Malformed target string, invalid configuration or missing registry entry.
    #[error("validation error: {0}")]
    Validation(String),

    /// A message token fell outside the accepted date window.
    #[error("token error: {0}")]
    Token(String),

    /// An envelope could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The broker rejected an operation (missing exchange, closed channel, ...).
    #[error("broker error: {0}")]
    Broker(String),

    /// Params could not be encoded or decoded as JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Spawning a thread or another OS-level operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal queue was closed by its peer.
    #[error("channel closed")]
    ChannelClosed,
}

impl ServiceBusError {
    /// Whether this error means the underlying broker link is gone.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Broker(_))
    }
}

/// Convenience result type for service bus operations.
pub type Result<T> = std::result::Result<T, ServiceBusError>;
