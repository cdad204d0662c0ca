//! CTAP2 wire types
//!
//! Structures that go into request maps as nested CBOR. Field names and
//! omission rules follow the WebAuthn dictionaries the authenticator
//! expects; optional fields are skipped rather than sent as `null`.

use serde::{Deserialize, Serialize};

/// Relying party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelyingParty {
    /// RP identifier, e.g. "example.org"
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RelyingParty {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// User account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Opaque user handle, unique per account
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    // Declared in canonical CBOR key order: shorter keys first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl User {
    pub fn new(id: Vec<u8>) -> Self {
        Self {
            id,
            name: None,
            display_name: None,
            icon: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// Credential reference used in allow and exclude lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyCredentialDescriptor {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(rename = "type")]
    pub cred_type: String,
}

impl PublicKeyCredentialDescriptor {
    pub fn new(id: Vec<u8>) -> Self {
        Self {
            id,
            cred_type: "public-key".to_string(),
        }
    }
}

/// One acceptable (type, algorithm) pair for a new credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyCredentialParameters {
    pub alg: i32,

    #[serde(rename = "type")]
    pub cred_type: String,
}

impl PublicKeyCredentialParameters {
    pub fn new(alg: CoseAlgorithm) -> Self {
        Self {
            alg: alg.to_i32(),
            cred_type: "public-key".to_string(),
        }
    }
}

/// COSE algorithm identifiers FIDO2 authenticators implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CoseAlgorithm {
    /// ECDSA with P-256 and SHA-256
    ES256 = -7,
    /// Ed25519
    EdDSA = -8,
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256 = -257,
}

impl CoseAlgorithm {
    pub fn to_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            -7 => Some(Self::ES256),
            -8 => Some(Self::EdDSA),
            -257 => Some(Self::RS256),
            _ => None,
        }
    }
}

/// credProtect extension policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CredProtect {
    UserVerificationOptional = 0x01,
    UserVerificationOptionalWithCredentialIdList = 0x02,
    UserVerificationRequired = 0x03,
}

impl CredProtect {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::UserVerificationOptional),
            0x02 => Some(Self::UserVerificationOptionalWithCredentialIdList),
            0x03 => Some(Self::UserVerificationRequired),
            _ => None,
        }
    }
}
