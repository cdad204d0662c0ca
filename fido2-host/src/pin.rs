//! ClientPIN: key agreement and PIN/UV auth tokens
//!
//! <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#authenticatorClientPIN>

use crate::device::Exchange;
use crate::error::{Error, Result};
use crate::info::AuthenticatorInfo;

use fido2_host_crypto::{PinProtocol, SharedSecret, pin_hash};
use fido2_host_ctap::cbor::{MapBuilder, MapParser, Value};
use fido2_host_ctap::{CtapCommand, StatusCode};

use zeroize::Zeroizing;

mod sub_command {
    pub const GET_KEY_AGREEMENT: u8 = 0x02;
    pub const GET_PIN_TOKEN: u8 = 0x05;
    pub const GET_PIN_UV_AUTH_TOKEN_USING_PIN_WITH_PERMISSIONS: u8 = 0x09;
}

/// Token permissions (getPinUvAuthTokenUsingPinWithPermissions)
pub(crate) mod permission {
    pub const MAKE_CREDENTIAL: u8 = 0x01;
    pub const GET_ASSERTION: u8 = 0x02;
}

const MIN_PIN_LENGTH: usize = 4;
const MAX_PIN_LENGTH: usize = 63;

/// Platform public key as a COSE_Key: {1: 2, 3: -25, -1: 1, -2: x, -3: y}
fn cose_key(x: &[u8; 32], y: &[u8; 32]) -> Result<Vec<u8>> {
    Ok(MapBuilder::new()
        .insert(1, 2)? // kty: EC2
        .insert(3, -25)? // alg: ECDH-ES+HKDF-256
        .insert(-1, 1)? // crv: P-256
        .insert_bytes(-2, x)?
        .insert_bytes(-3, y)?
        .build())
}

/// Outcome of getKeyAgreement: our half of the exchange and the derived keys
pub(crate) struct KeyAgreement {
    /// Encoded COSE key to send back to the authenticator
    pub platform_key: Vec<u8>,
    pub shared: SharedSecret,
}

pub(crate) fn key_agreement(ex: &mut Exchange<'_>, protocol: PinProtocol) -> Result<KeyAgreement> {
    let params = MapBuilder::new()
        .insert(0x01, protocol.version())?
        .insert(0x02, sub_command::GET_KEY_AGREEMENT)?
        .build();

    let body = ex
        .cbor(CtapCommand::ClientPin, Some(&params))?
        .ok_or_else(|| Error::Protocol("empty getKeyAgreement response".to_string()))?;
    let peer: Value = MapParser::from_value(body)?.get(0x01)?;
    let peer = MapParser::from_value(peer)?;
    let (peer_x, peer_y) = (peer.get_bytes(-2)?, peer.get_bytes(-3)?);

    let ((x, y), shared) = protocol.encapsulate(&peer_x, &peer_y)?;
    tracing::trace!(protocol = protocol.version(), "key agreement complete");
    Ok(KeyAgreement {
        platform_key: cose_key(&x, &y)?,
        shared,
    })
}

/// PIN/UV auth token obtained from the authenticator
pub(crate) struct PinUvAuthToken {
    protocol: PinProtocol,
    token: Zeroizing<Vec<u8>>,
}

impl PinUvAuthToken {
    pub fn protocol(&self) -> PinProtocol {
        self.protocol
    }

    /// pinUvAuthParam over `data` (the client data hash, for credential commands)
    pub fn authenticate(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.protocol.authenticate(&self.token, data)?)
    }
}

/// Trade `pin` for a PIN/UV auth token
///
/// Uses the permissions variant when the authenticator advertises
/// `pinUvAuthToken`, scoping the token to `permissions` and `rp_id`.
/// A wrong PIN comes back as `Device(PinInvalid)` and is never retried.
pub(crate) fn get_pin_token(
    ex: &mut Exchange<'_>,
    info: &AuthenticatorInfo,
    pin: &str,
    permissions: u8,
    rp_id: Option<&str>,
) -> Result<PinUvAuthToken> {
    if !info.has_pin() {
        return Err(Error::Device(StatusCode::PinNotSet));
    }
    if !(MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&pin.len()) {
        return Err(Error::InvalidArgument("PIN must be 4 to 63 bytes"));
    }

    let protocol = info.preferred_pin_protocol();
    let agreement = key_agreement(ex, protocol)?;
    let pin_hash_enc = agreement.shared.encrypt(&pin_hash(pin))?;

    let mut params = MapBuilder::new()
        .insert(0x01, protocol.version())?
        .insert_encoded(0x03, agreement.platform_key)
        .insert_bytes(0x06, &pin_hash_enc)?;
    params = if info.option("pinUvAuthToken") == Some(true) {
        params
            .insert(0x02, sub_command::GET_PIN_UV_AUTH_TOKEN_USING_PIN_WITH_PERMISSIONS)?
            .insert(0x09, permissions)?
            .insert_opt(0x0A, rp_id)?
    } else {
        params.insert(0x02, sub_command::GET_PIN_TOKEN)?
    };

    let body = ex
        .cbor(CtapCommand::ClientPin, Some(&params.build()))?
        .ok_or_else(|| Error::Protocol("empty getPinToken response".to_string()))?;
    let token_enc = MapParser::from_value(body)?.get_bytes(0x02)?;
    let token = Zeroizing::new(agreement.shared.decrypt(&token_enc)?);
    tracing::debug!(protocol = protocol.version(), "obtained pin token");

    Ok(PinUvAuthToken { protocol, token })
}
