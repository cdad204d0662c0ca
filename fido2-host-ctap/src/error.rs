//! Codec errors
//!
//! These describe malformed bytes, never an authenticator's verdict.
//! Status codes from the device travel separately as raw bytes.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Bytes are not valid CBOR, or could not be encoded
    #[error("invalid CBOR")]
    InvalidCbor,

    /// CBOR was valid but had the wrong shape
    #[error("unexpected CBOR type for {0}")]
    UnexpectedType(&'static str),

    /// A required map key was absent
    #[error("missing required field {0}")]
    MissingField(i32),

    /// Response frame carried no status byte
    #[error("empty response")]
    EmptyResponse,

    /// Authenticator data shorter than its declared contents
    #[error("truncated authenticator data")]
    TruncatedAuthData,
}

pub type Result<T> = core::result::Result<T, CodecError>;
