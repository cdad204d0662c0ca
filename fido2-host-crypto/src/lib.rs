//! Cryptography for the platform side of CTAP2
//!
//! - **ECDH**: ephemeral P-256 key agreement with the authenticator
//! - **PIN/UV auth protocols**: key derivation, encryption and MACs for
//!   protocols one and two
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html>

pub mod ecdh;
pub mod error;
pub mod pin_protocol;

pub use ecdh::KeyPair;
pub use error::{CryptoError, Result};
pub use pin_protocol::{PinProtocol, SharedSecret, pin_hash};
