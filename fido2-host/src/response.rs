//! Decoded MakeCredential and GetAssertion results

use crate::error::{Error, Result};

use fido2_host_crypto::SharedSecret;
use fido2_host_ctap::cbor::{self, MapParser, Value, int_entry, text_entry};
use fido2_host_ctap::{CoseAlgorithm, CredProtect, User};

use bitflags::bitflags;

bitflags! {
    /// Authenticator data flags byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthDataFlags: u8 {
        /// User present
        const UP = 0x01;
        /// User verified
        const UV = 0x04;
        /// Backup eligible
        const BE = 0x08;
        /// Backed up
        const BS = 0x10;
        /// Attested credential data included
        const AT = 0x40;
        /// Extension data included
        const ED = 0x80;
    }
}

/// Credential data attached to authenticator data at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredential {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    /// COSE_Key, as encoded by the authenticator
    pub public_key: Vec<u8>,
}

/// Parsed authenticator data
///
/// ```text
/// rpIdHash (32) | flags (1) | signCount (4, BE) | [attested credential] | [extensions]
/// attested credential = aaguid (16) | credIdLen (2, BE) | credId | COSE key
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: AuthDataFlags,
    pub sign_count: u32,
    pub attested: Option<AttestedCredential>,
    /// Extension outputs map
    pub extensions: Option<Value>,
}

impl AuthenticatorData {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let truncated = || Error::from(fido2_host_ctap::CodecError::TruncatedAuthData);

        let header = data.get(..37).ok_or_else(truncated)?;
        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&header[..32]);
        let flags = AuthDataFlags::from_bits_retain(header[32]);
        let sign_count = u32::from_be_bytes([header[33], header[34], header[35], header[36]]);
        let mut rest = &data[37..];

        let attested = if flags.contains(AuthDataFlags::AT) {
            let fixed = rest.get(..18).ok_or_else(truncated)?;
            let mut aaguid = [0u8; 16];
            aaguid.copy_from_slice(&fixed[..16]);
            let id_len = usize::from(u16::from_be_bytes([fixed[16], fixed[17]]));
            let credential_id = rest.get(18..18 + id_len).ok_or_else(truncated)?.to_vec();

            let (public_key, tail) = cbor::split_first_item(&rest[18 + id_len..])?;
            rest = tail;
            Some(AttestedCredential {
                aaguid,
                credential_id,
                public_key: public_key.to_vec(),
            })
        } else {
            None
        };

        let extensions = if flags.contains(AuthDataFlags::ED) {
            let (ext, tail) = cbor::split_first_item(rest)?;
            rest = tail;
            Some(cbor::decode::<Value>(ext)?)
        } else {
            None
        };

        if !rest.is_empty() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes in authenticator data",
                rest.len()
            )));
        }

        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            attested,
            extensions,
        })
    }

    fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.as_ref().and_then(|ext| text_entry(ext, name))
    }
}

/// Attestation statement fields common to "packed" and "fido-u2f"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttestationStatement {
    pub alg: Option<i32>,
    pub sig: Option<Vec<u8>>,
    /// Certificate chain, leaf first; empty for self attestation
    pub x5c: Vec<Vec<u8>>,
}

impl AttestationStatement {
    fn from_value(value: &Value) -> Self {
        let alg = match text_entry(value, "alg") {
            Some(Value::Integer(alg)) => i32::try_from(*alg).ok(),
            _ => None,
        };
        let sig = match text_entry(value, "sig") {
            Some(Value::Bytes(sig)) => Some(sig.clone()),
            _ => None,
        };
        let x5c = match text_entry(value, "x5c") {
            Some(Value::Array(certs)) => certs
                .iter()
                .filter_map(|cert| match cert {
                    Value::Bytes(der) => Some(der.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Self { alg, sig, x5c }
    }
}

/// Result of [`Device::make_credential`](crate::Device::make_credential)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Attestation statement format, e.g. "packed"
    pub format: String,
    /// Raw authenticator data, as signed
    pub auth_data: Vec<u8>,
    pub statement: AttestationStatement,
    pub credential_id: Vec<u8>,
    pub aaguid: [u8; 16],
    /// COSE_Key bytes
    pub public_key: Vec<u8>,
    /// COSE algorithm of `public_key` (label 3)
    pub algorithm: i32,
    pub sign_count: u32,
    pub flags: AuthDataFlags,
    /// The authenticator bound an hmac-secret to this credential
    pub hmac_secret: bool,
    pub cred_protect: Option<CredProtect>,
}

impl Attestation {
    /// Decode `{1: fmt, 2: authData, 3: attStmt}`
    pub(crate) fn from_value(body: Value) -> Result<Self> {
        let parser = MapParser::from_value(body)?;
        let format: String = parser.get(0x01)?;
        let auth_data = parser.get_bytes(0x02)?;
        let statement = parser
            .get_raw(0x03)
            .map(AttestationStatement::from_value)
            .unwrap_or_default();

        let parsed = AuthenticatorData::parse(&auth_data)?;
        let Some(credential) = parsed.attested.clone() else {
            return Err(Error::Protocol(
                "attestation without attested credential data".to_string(),
            ));
        };

        let cose: Value = cbor::decode(&credential.public_key)?;
        let algorithm = match int_entry(&cose, 3) {
            Some(Value::Integer(alg)) => i32::try_from(*alg)
                .map_err(|_| Error::Protocol("COSE algorithm out of range".to_string()))?,
            _ => return Err(Error::Protocol("COSE key without algorithm".to_string())),
        };

        let hmac_secret = matches!(parsed.extension("hmac-secret"), Some(Value::Bool(true)));
        let cred_protect = match parsed.extension("credProtect") {
            Some(Value::Integer(level)) => u8::try_from(*level).ok().and_then(CredProtect::from_u8),
            _ => None,
        };

        Ok(Self {
            format,
            statement,
            credential_id: credential.credential_id,
            aaguid: credential.aaguid,
            public_key: credential.public_key,
            algorithm,
            sign_count: parsed.sign_count,
            flags: parsed.flags,
            hmac_secret,
            cred_protect,
            auth_data,
        })
    }

    pub fn cose_algorithm(&self) -> Option<CoseAlgorithm> {
        CoseAlgorithm::from_i32(self.algorithm)
    }
}

/// Result of [`Device::get_assertion`](crate::Device::get_assertion)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub credential_id: Vec<u8>,
    pub auth_data: Vec<u8>,
    pub signature: Vec<u8>,
    /// Present for discoverable credentials
    pub user: Option<User>,
    pub sign_count: u32,
    pub flags: AuthDataFlags,
    /// Total matching credentials, reported on the first assertion only
    pub number_of_credentials: Option<u32>,
    /// Decrypted hmac-secret output (32 or 64 bytes)
    pub hmac_secret: Option<Vec<u8>>,
}

impl Assertion {
    /// Decode `{1: credential, 2: authData, 3: signature, 4: user, 5: numberOfCredentials}`
    ///
    /// The credential may be omitted when the allow list held exactly one ID.
    pub(crate) fn from_value(
        body: Value,
        allow_list: &[Vec<u8>],
        secret: Option<&SharedSecret>,
    ) -> Result<Self> {
        let parser = MapParser::from_value(body)?;

        let credential_id = match parser.get_raw(0x01).and_then(|cred| text_entry(cred, "id")) {
            Some(Value::Bytes(id)) => id.clone(),
            Some(_) => return Err(Error::Protocol("credential id is not a byte string".to_string())),
            None => match allow_list {
                [only] => only.clone(),
                _ => return Err(Error::Protocol("assertion without credential".to_string())),
            },
        };

        let auth_data = parser.get_bytes(0x02)?;
        let signature = parser.get_bytes(0x03)?;
        let user: Option<User> = parser.get_opt(0x04)?;
        let number_of_credentials: Option<u32> = parser.get_opt(0x05)?;

        let parsed = AuthenticatorData::parse(&auth_data)?;
        let hmac_secret = match (parsed.extension("hmac-secret"), secret) {
            (Some(Value::Bytes(output)), Some(secret)) => Some(secret.decrypt(output)?),
            (Some(_), None) => {
                tracing::debug!("ignoring unrequested hmac-secret output");
                None
            }
            (Some(_), Some(_)) => {
                return Err(Error::Protocol("hmac-secret output is not a byte string".to_string()));
            }
            (None, _) => None,
        };

        Ok(Self {
            credential_id,
            signature,
            user,
            sign_count: parsed.sign_count,
            flags: parsed.flags,
            number_of_credentials,
            hmac_secret,
            auth_data,
        })
    }
}
