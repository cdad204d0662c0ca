//! Caller-facing request parameters
//!
//! Optional fields are modelled as typed keys with explicit presence, so
//! the encoder can only ever emit keys the protocol defines.

use crate::error::{Error, Result};

use fido2_host_ctap::CredProtect;

use serde::Serialize;
use sha2::{Digest, Sha256};

use std::time::Duration;

/// A validated client data hash (exactly 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientDataHash([u8; 32]);

impl ClientDataHash {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// SHA-256 of the serialized client data (collectedClientData JSON)
    pub fn digest(client_data: &[u8]) -> Self {
        Self(Sha256::digest(client_data).into())
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the slice is not exactly 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let hash: [u8; 32] = slice
            .try_into()
            .map_err(|_| Error::InvalidArgument("client data hash must be 32 bytes"))?;
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ClientDataHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ClientDataHash {
    fn from(hash: [u8; 32]) -> Self {
        Self::new(hash)
    }
}

/// Tri-state authenticator option
///
/// `Default` leaves the key out of the request so the authenticator
/// applies its own default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptionValue {
    #[default]
    Default,
    True,
    False,
}

impl OptionValue {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            OptionValue::Default => None,
            OptionValue::True => Some(true),
            OptionValue::False => Some(false),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        if value {
            OptionValue::True
        } else {
            OptionValue::False
        }
    }
}

/// Extensions requested at credential creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MakeCredentialExtensions {
    /// Ask the authenticator to bind a CredRandom for later hmac-secret use
    pub hmac_secret: bool,
    pub cred_protect: Option<CredProtect>,
}

impl MakeCredentialExtensions {
    pub fn is_empty(&self) -> bool {
        !self.hmac_secret && self.cred_protect.is_none()
    }
}

/// Wire form of [`MakeCredentialExtensions`]
#[derive(Serialize)]
pub(crate) struct MakeCredentialExtensionsWire {
    // Canonical order: "credProtect" (11) sorts before "hmac-secret" (11) lexically
    #[serde(rename = "credProtect", skip_serializing_if = "Option::is_none")]
    pub cred_protect: Option<u8>,
    #[serde(rename = "hmac-secret", skip_serializing_if = "Option::is_none")]
    pub hmac_secret: Option<bool>,
}

impl From<&MakeCredentialExtensions> for MakeCredentialExtensionsWire {
    fn from(ext: &MakeCredentialExtensions) -> Self {
        Self {
            cred_protect: ext.cred_protect.map(CredProtect::to_u8),
            hmac_secret: ext.hmac_secret.then_some(true),
        }
    }
}

/// The `options` map (rk, up, uv), omitted keys left to the authenticator
#[derive(Debug, Default, Serialize)]
pub(crate) struct OptionsWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rk: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv: Option<bool>,
}

impl OptionsWire {
    pub fn is_empty(&self) -> bool {
        self.rk.is_none() && self.up.is_none() && self.uv.is_none()
    }
}

/// Parameters for [`Device::make_credential`](crate::Device::make_credential)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MakeCredentialOptions {
    /// Credential IDs the authenticator must not already hold for this RP
    pub exclude_list: Vec<Vec<u8>>,
    pub extensions: MakeCredentialExtensions,
    /// Resident (discoverable) key
    pub rk: OptionValue,
    pub uv: OptionValue,
    /// Overrides [`ClientConfig::operation_timeout`](crate::ClientConfig) for this call
    pub timeout: Option<Duration>,
}

impl MakeCredentialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exclude_list(mut self, exclude_list: Vec<Vec<u8>>) -> Self {
        self.exclude_list = exclude_list;
        self
    }

    pub fn with_hmac_secret(mut self) -> Self {
        self.extensions.hmac_secret = true;
        self
    }

    pub fn with_cred_protect(mut self, policy: CredProtect) -> Self {
        self.extensions.cred_protect = Some(policy);
        self
    }

    pub fn with_resident_key(mut self, rk: bool) -> Self {
        self.rk = rk.into();
        self
    }

    pub fn with_user_verification(mut self, uv: bool) -> Self {
        self.uv = uv.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Parameters for [`Device::get_assertion`](crate::Device::get_assertion)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssertionOptions {
    /// User presence
    pub up: OptionValue,
    pub uv: OptionValue,
    /// hmac-secret salt: one 32-byte salt, or two concatenated
    pub hmac_salt: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl AssertionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_presence(mut self, up: bool) -> Self {
        self.up = up.into();
        self
    }

    pub fn with_user_verification(mut self, uv: bool) -> Self {
        self.uv = uv.into();
        self
    }

    pub fn with_hmac_salt(mut self, salt: Vec<u8>) -> Self {
        self.hmac_salt = Some(salt);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match &self.hmac_salt {
            Some(salt) if salt.len() != 32 && salt.len() != 64 => {
                Err(Error::InvalidArgument("hmac-secret salt must be 32 or 64 bytes"))
            }
            _ => Ok(()),
        }
    }
}
