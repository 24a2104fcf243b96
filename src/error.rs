//! Error types for opwire.

use thiserror::Error;

/// Main error type for all operation-layer failures.
#[derive(Debug, Error)]
pub enum OpwireError {
    /// Message size exceeds the connection's maximum message size.
    #[error("message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Requested payload cannot fit a legal message at creation time.
    #[error("payload of {payload} bytes cannot fit a message of at most {max} bytes")]
    InvalidSize { payload: usize, max: usize },

    /// Fewer bytes than a full header were available.
    #[error("truncated header: got {got} bytes, need {need}")]
    MalformedHeader { got: usize, need: usize },

    /// The declared header size disagrees with the received byte count.
    #[error("header declares {declared} bytes but {received} arrived")]
    HeaderSizeMismatch { declared: usize, received: usize },

    /// A response arrived whose id has no pending match.
    #[error("no pending operation with id {0}")]
    OperationNotFound(u16),

    /// An inbound response exceeds the pre-allocated response buffer.
    #[error("response of {got} bytes exceeds buffer of {capacity} bytes")]
    ResponseBufferTooSmall { got: usize, capacity: usize },

    /// No handler registered for the connection's protocol.
    #[error("no handler registered for protocol {0:#04x}")]
    ProtocolUnsupported(u8),

    /// Transport buffer allocation failed.
    #[error("transport buffer allocation failed")]
    OutOfMemory,

    /// A blocking wait was cancelled before the response arrived.
    #[error("operation interrupted")]
    Interrupted,

    /// The transport link is gone.
    #[error("transport closed")]
    TransportClosed,

    /// A response payload did not have the expected shape or content.
    #[error("response payload mismatch")]
    PayloadMismatch,
}

/// Result type alias using OpwireError.
pub type Result<T> = std::result::Result<T, OpwireError>;
