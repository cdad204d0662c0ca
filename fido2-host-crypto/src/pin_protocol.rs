//! PIN/UV auth protocols one and two, platform side
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#sctn-pin-uv-auth-protocols>
//!
//! | | protocol 1 | protocol 2 |
//! |---|---|---|
//! | KDF | SHA-256(Z) for both keys | HKDF-SHA-256, separate HMAC and AES keys |
//! | encrypt | AES-256-CBC, zero IV | AES-256-CBC, random IV prepended |
//! | authenticate | HMAC-SHA-256, first 16 bytes | HMAC-SHA-256, all 32 bytes |

use crate::ecdh::KeyPair;
use crate::error::{CryptoError, Result};

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const BLOCK: usize = 16;

/// PIN/UV auth protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinProtocol {
    V1,
    V2,
}

impl PinProtocol {
    pub fn version(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    pub fn from_version(version: u8) -> Result<Self> {
        match version {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(CryptoError::UnsupportedProtocol(other)),
        }
    }

    /// Derive the shared secret from Z, the ECDH x coordinate
    pub fn kdf(self, z: &[u8; 32]) -> Result<SharedSecret> {
        let (hmac_key, aes_key) = match self {
            Self::V1 => {
                let key: [u8; 32] = Sha256::digest(z).into();
                (key, key)
            }
            Self::V2 => {
                let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), z);
                let mut hmac_key = [0u8; 32];
                let mut aes_key = [0u8; 32];
                hkdf.expand(b"CTAP2 HMAC key", &mut hmac_key)
                    .map_err(|_| CryptoError::KeyDerivationFailed)?;
                hkdf.expand(b"CTAP2 AES key", &mut aes_key)
                    .map_err(|_| CryptoError::KeyDerivationFailed)?;
                (hmac_key, aes_key)
            }
        };

        Ok(SharedSecret {
            protocol: self,
            hmac_key,
            aes_key,
        })
    }

    /// Run the platform half of key agreement against the authenticator's
    /// public key, returning our public (x, y) and the derived secret
    pub fn encapsulate(self, peer_x: &[u8], peer_y: &[u8]) -> Result<(([u8; 32], [u8; 32]), SharedSecret)> {
        let keypair = KeyPair::generate();
        let z = keypair.shared_point_x(peer_x, peer_y)?;
        Ok((keypair.public_key_xy(), self.kdf(&z)?))
    }

    /// MAC `data` under `key` (a shared secret's HMAC key or a PIN token)
    pub fn authenticate(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| {
            CryptoError::InvalidLength {
                expected: 32,
                actual: key.len(),
            }
        })?;
        mac.update(data);
        let tag = mac.finalize().into_bytes();

        Ok(match self {
            Self::V1 => tag[..16].to_vec(),
            Self::V2 => tag.to_vec(),
        })
    }

    /// Constant-time check of a MAC produced by [`authenticate`](Self::authenticate)
    pub fn verify(self, key: &[u8], data: &[u8], tag: &[u8]) -> bool {
        match self.authenticate(key, data) {
            Ok(expected) => expected.ct_eq(tag).into(),
            Err(_) => false,
        }
    }
}

/// Keys derived from one key agreement
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    #[zeroize(skip)]
    protocol: PinProtocol,
    hmac_key: [u8; 32],
    aes_key: [u8; 32],
}

impl SharedSecret {
    pub fn protocol(&self) -> PinProtocol {
        self.protocol
    }

    /// Encrypt a block-aligned plaintext
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.is_empty() || plaintext.len() % BLOCK != 0 {
            return Err(CryptoError::EncryptionFailed);
        }

        let mut iv = [0u8; BLOCK];
        if self.protocol == PinProtocol::V2 {
            OsRng.fill_bytes(&mut iv);
        }

        let mut buf = plaintext.to_vec();
        Aes256CbcEnc::new((&self.aes_key).into(), &iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut buf, plaintext.len())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(match self.protocol {
            PinProtocol::V1 => buf,
            PinProtocol::V2 => {
                let mut out = iv.to_vec();
                out.extend_from_slice(&buf);
                out
            }
        })
    }

    /// Decrypt what the authenticator encrypted under this secret
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (iv, body) = match self.protocol {
            PinProtocol::V1 => ([0u8; BLOCK], ciphertext),
            PinProtocol::V2 => {
                if ciphertext.len() < BLOCK {
                    return Err(CryptoError::DecryptionFailed);
                }
                let (iv, body) = ciphertext.split_at(BLOCK);
                let mut iv_arr = [0u8; BLOCK];
                iv_arr.copy_from_slice(iv);
                (iv_arr, body)
            }
        };
        if body.is_empty() || body.len() % BLOCK != 0 {
            return Err(CryptoError::DecryptionFailed);
        }

        let mut buf = body.to_vec();
        let len = Aes256CbcDec::new((&self.aes_key).into(), &iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| CryptoError::DecryptionFailed)?
            .len();
        buf.truncate(len);
        Ok(buf)
    }

    /// MAC `data` under this secret's HMAC key
    pub fn authenticate(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.protocol.authenticate(&self.hmac_key, data)
    }
}

/// LEFT(SHA-256(pin), 16), the value getPinToken encrypts
pub fn pin_hash(pin: &str) -> [u8; 16] {
    let digest = Sha256::digest(pin.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}
