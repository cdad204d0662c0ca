//! Error types for cryptographic operations

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Peer public key is not a valid P-256 point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Input length does not fit the operation
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// PIN/UV auth protocol number we do not implement
    #[error("unsupported PIN/UV auth protocol {0}")]
    UnsupportedProtocol(u8),
}

pub type Result<T> = core::result::Result<T, CryptoError>;
