//! Error types for host-side CTAP operations

use fido2_host_crypto::CryptoError;
use fido2_host_ctap::{CodecError, StatusCode};

use thiserror::Error;

/// Everything a device operation can fail with
///
/// The variants keep a caller's reactions apart: re-prompt for a PIN on
/// `Device(PinInvalid)`, silently drop the operation on `Cancelled`,
/// offer a retry on `TimedOut`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Device unreachable, busy or faulting
    #[error("transport error: {0}")]
    Transport(#[from] fido2_host_transport::Error),

    /// Malformed or unexpected frame from the device
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The authenticator rejected the request
    #[error("{0}")]
    Device(StatusCode),

    /// We asked the device to stop and it did
    #[error("operation cancelled")]
    Cancelled,

    /// No frame arrived in time
    #[error("operation timed out")]
    TimedOut,

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The device handle has been closed
    #[error("device closed")]
    Closed,

    /// The device lacks a capability the request needs
    #[error("unsupported by device: {0}")]
    Unsupported(&'static str),

    /// Caller-supplied argument out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// CTAP status code, if the device produced this error
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Device(status) => Some(*status),
            _ => None,
        }
    }

    /// True for the statuses that call for (re-)entering a PIN
    pub fn is_pin_error(&self) -> bool {
        self.status().is_some_and(StatusCode::is_pin_error)
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
