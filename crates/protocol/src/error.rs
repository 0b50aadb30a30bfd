//! Protocol error types

use thiserror::Error;

/// Errors raised while framing or unframing link traffic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes left in the transfer than a frame header needs
    #[error("Truncated frame header: needed {needed} bytes, got {available}")]
    TruncatedHeader { needed: usize, available: usize },

    /// Header declares more payload than the transfer still holds
    #[error("Frame length {declared} exceeds remaining transfer bytes ({remaining})")]
    LengthOverrun { declared: usize, remaining: usize },

    /// Kind tag is neither Normal nor Disconnect
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u32),

    /// Payload cannot be described by a 32-bit length
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
