//! CTAP2 message codec
//!
//! Everything needed to turn a logical CTAP2 request into bytes and a
//! response frame back into a status and a CBOR map:
//!
//! - **cbor**: canonical map building and parsing over cbor4ii
//! - **command**: opcodes, request framing, response splitting
//! - **status**: CTAP2 status codes
//! - **types**: RP, user and credential structures
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#message-encoding>

pub mod cbor;
pub mod command;
pub mod error;
pub mod status;
pub mod types;

pub use command::{CtapCommand, CtapResponse, decode_response, encode_command};
pub use error::{CodecError, Result};
pub use status::StatusCode;
pub use types::{
    CoseAlgorithm, CredProtect, PublicKeyCredentialDescriptor, PublicKeyCredentialParameters,
    RelyingParty, User,
};
