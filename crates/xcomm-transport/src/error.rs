use crate::endpoint::Protocol;

/// Errors returned by the cross-system transport layer.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("unknown system: {0}")]
    UnknownSystem(String),

    #[error("system already registered: {0}")]
    DuplicateSystem(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(Protocol),

    #[error("system {0} is not connected")]
    NotConnected(String),

    #[error("connection to {system_id} failed: {source}")]
    Connect {
        system_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("send to {system_id} failed: {source}")]
    Send {
        system_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("connection to {0} closed")]
    ConnectionClosed(String),

    #[error("{system_id} answered with HTTP {status}")]
    HttpStatus { system_id: String, status: u16 },

    #[error("message serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("message deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message {message_id} exhausted its {max_retries} retries")]
    RetriesExhausted { message_id: String, max_retries: u32 },

    #[error("message {0} expired before it could be sent")]
    Expired(String),

    #[error("tls setup failed: {0}")]
    Tls(String),
}

impl CommError {
    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            CommError::ConnectionClosed(_) | CommError::MessageTooLarge { .. }
        )
    }
}
