use thiserror::Error;

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// Broker unreachable, credentials rejected, or virtual host missing
    #[error("connection error: {0}")]
    Connection(String),

    /// Delivery stream ended without a shutdown request
    #[error("broker connection lost")]
    ConnectionLost,

    /// Request or response publish rejected by the transport
    #[error("publish failed: {0}")]
    Publish(String),

    /// No response within the caller-specified deadline
    #[error("request timed out")]
    Timeout,

    /// Pending request abandoned before a response arrived
    #[error("request cancelled")]
    Cancelled,

    /// Correlation identifier already registered
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),

    /// Worker processing function failed
    #[error("processing failed: {0}")]
    Processing(String),

    /// Other transport failure (queue declare, ack, nack)
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Required configuration value missing
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Request lacks correlation id or reply destination
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
