#![warn(unused_extern_crates)]

//! # fido2-host
//!
//! Host-side CTAP2 client for FIDO2 security keys.
//!
//! ## Architecture
//!
//! - **Client**: discovers authenticators and opens them
//! - **Device**: one open authenticator; runs GetInfo, MakeCredential,
//!   GetAssertion and ClientPIN, one command at a time
//! - **Session**: a single CTAPHID request/response exchange with
//!   keepalive handling, cancellation and timeouts
//! - **Touch**: background presence probe
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "usb")]
//! # fn main() -> Result<(), fido2_host::Error> {
//! use fido2_host::{
//!     AssertionOptions, Client, ClientConfig, ClientDataHash, CoseAlgorithm,
//!     MakeCredentialOptions, RelyingParty, User,
//! };
//!
//! let client = Client::new(ClientConfig::default());
//! let Some(location) = client.discover().next() else {
//!     return Ok(());
//! };
//! let device = client.open(&location)?;
//!
//! let hash = ClientDataHash::new([0; 32]);
//! let attestation = device.make_credential(
//!     &hash,
//!     &RelyingParty::new("example.org"),
//!     &User::new(vec![1; 32]).with_name("alice"),
//!     CoseAlgorithm::ES256,
//!     None,
//!     &MakeCredentialOptions::new().with_hmac_secret(),
//! )?;
//!
//! let assertion = device.get_assertion(
//!     "example.org",
//!     &hash,
//!     &[attestation.credential_id],
//!     None,
//!     &AssertionOptions::new().with_hmac_salt(vec![7; 32]),
//! )?;
//! # let _ = assertion;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "usb"))]
//! # fn main() {}
//! ```

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod info;
mod pin;
pub mod request;
pub mod response;
pub mod session;
pub mod touch;
mod transport;

pub use client::{Client, Discovery};
pub use config::ClientConfig;
pub use device::{Device, DeviceType};
pub use error::{Error, Result};
pub use info::AuthenticatorInfo;
pub use request::{
    AssertionOptions, ClientDataHash, MakeCredentialExtensions, MakeCredentialOptions, OptionValue,
};
pub use response::{
    Assertion, AttestationStatement, Attestation, AttestedCredential, AuthDataFlags,
    AuthenticatorData,
};
pub use session::{CancelToken, KeepaliveObserver, SessionState};
pub use touch::TouchHandle;

pub use fido2_host_ctap::{CoseAlgorithm, CredProtect, RelyingParty, StatusCode, User};
pub use fido2_host_transport::{DeviceLocation, HidBackend, HidConnection, KeepaliveStatus};
