//! authenticatorGetInfo response

use crate::error::Result;

use fido2_host_crypto::PinProtocol;
use fido2_host_ctap::cbor::{MapParser, Value};

use std::collections::BTreeMap;

/// What an authenticator says about itself
///
/// Decoded from the integer-keyed GetInfo map:
/// ```cbor
/// {
///   0x01: versions (array of text),
///   0x02: extensions (array of text, optional),
///   0x03: aaguid (16 bytes),
///   0x04: options (map text -> bool, optional),
///   0x05: maxMsgSize (unsigned, optional),
///   0x06: pinUvAuthProtocols (array of unsigned, optional),
///   ...
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorInfo {
    /// e.g. "FIDO_2_0", "FIDO_2_1", "U2F_V2"
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub aaguid: [u8; 16],
    pub options: BTreeMap<String, bool>,
    pub max_msg_size: Option<u32>,
    pub pin_uv_auth_protocols: Vec<u8>,
    pub max_credential_count_in_list: Option<u32>,
    pub max_credential_id_length: Option<u32>,
    pub transports: Vec<String>,
    pub min_pin_length: Option<u32>,
    pub firmware_version: Option<u64>,
}

impl AuthenticatorInfo {
    pub fn from_value(value: Value) -> Result<Self> {
        let parser = MapParser::from_value(value)?;

        let aaguid_bytes = parser.get_bytes(0x03)?;
        let aaguid: [u8; 16] = aaguid_bytes.as_slice().try_into().map_err(|_| {
            crate::Error::Protocol(format!("aaguid is {} bytes", aaguid_bytes.len()))
        })?;

        Ok(Self {
            versions: parser.get(0x01)?,
            extensions: parser.get_opt(0x02)?.unwrap_or_default(),
            aaguid,
            options: parser.get_opt(0x04)?.unwrap_or_default(),
            max_msg_size: parser.get_opt(0x05)?,
            pin_uv_auth_protocols: parser.get_opt(0x06)?.unwrap_or_default(),
            max_credential_count_in_list: parser.get_opt(0x07)?,
            max_credential_id_length: parser.get_opt(0x08)?,
            transports: parser.get_opt(0x09)?.unwrap_or_default(),
            min_pin_length: parser.get_opt(0x0D)?,
            firmware_version: parser.get_opt(0x0E)?,
        })
    }

    /// Value of a boolean option; `None` when the device does not list it
    pub fn option(&self, name: &str) -> Option<bool> {
        self.options.get(name).copied()
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext == name)
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    /// True if a PIN is set on the device
    pub fn has_pin(&self) -> bool {
        self.option("clientPin") == Some(true)
    }

    /// True if built-in user verification (biometrics, say) is enrolled
    pub fn has_uv(&self) -> bool {
        self.option("uv") == Some(true)
    }

    /// PIN/UV auth protocol to use: two when listed, otherwise one
    pub fn preferred_pin_protocol(&self) -> PinProtocol {
        if self.pin_uv_auth_protocols.contains(&2) {
            PinProtocol::V2
        } else {
            PinProtocol::V1
        }
    }
}
