//! Transport layer error types

use thiserror::Error;

/// Transport layer result type
pub type Result<T> = std::result::Result<T, Error>;

/// Transport layer errors
///
/// None of these are retried by the transport; callers decide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No HID device at the given path
    #[error("device not found: {0}")]
    NotFound(String),

    /// Device path is already claimed by another handle
    #[error("device busy: {0}")]
    Busy(String),

    /// Underlying HID I/O fault
    #[error("I/O error: {0}")]
    Io(String),

    /// Report was not a well-formed CTAPHID packet
    #[error("invalid packet format")]
    InvalidPacket,

    /// Packet addressed a channel we did not expect
    #[error("invalid channel ID")]
    InvalidChannel,

    /// Unknown CTAPHID command byte
    #[error("invalid command")]
    InvalidCommand,

    /// Continuation packet out of order
    #[error("invalid sequence number")]
    InvalidSequence,

    /// Payload exceeds what CTAPHID can carry
    #[error("message too large")]
    MessageTooLarge,

    /// Message ended before its declared length
    #[error("message fragmentation error")]
    FragmentationError,

    /// Continuation packets stopped arriving
    #[error("timeout waiting for continuation packet")]
    Timeout,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
