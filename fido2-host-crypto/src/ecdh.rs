//! P-256 ECDH for PIN/UV auth protocol key agreement
//!
//! <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#pinProto1>

use crate::error::{CryptoError, Result};

use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey, elliptic_curve::sec1::ToEncodedPoint};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Ephemeral platform key pair, generated fresh for every key agreement
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public key as raw (x, y) coordinates for a COSE_Key
    pub fn public_key_xy(&self) -> ([u8; 32], [u8; 32]) {
        let point = self.public.to_encoded_point(false);
        let bytes = point.as_bytes();

        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&bytes[1..33]);
        y.copy_from_slice(&bytes[33..65]);
        (x, y)
    }

    /// Uncompressed SEC1 encoding (0x04 || x || y)
    pub fn public_key_sec1(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }

    /// ECDH with the authenticator's key, given as COSE (x, y) coordinates
    ///
    /// Returns Z, the x coordinate of the shared point.
    pub fn shared_point_x(&self, peer_x: &[u8], peer_y: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        if peer_x.len() != 32 || peer_y.len() != 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: peer_x.len().max(peer_y.len()),
            });
        }

        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(peer_x),
            FieldBytes::from_slice(peer_y),
            false,
        );
        let peer = PublicKey::from_sec1_bytes(point.as_bytes())
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut z = Zeroizing::new([0u8; 32]);
        z.copy_from_slice(shared.raw_secret_bytes());
        Ok(z)
    }
}
