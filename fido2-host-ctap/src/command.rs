//! CTAP2 command framing
//!
//! A request is one opcode byte followed by an optional CBOR parameter
//! map. A response is one status byte followed by an optional CBOR map.

use crate::cbor::{self, Value};
use crate::error::{CodecError, Result};

use std::fmt;

/// CTAP2 authenticator API opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CtapCommand {
    MakeCredential = 0x01,
    GetAssertion = 0x02,
    GetInfo = 0x04,
    ClientPin = 0x06,
    Reset = 0x07,
    GetNextAssertion = 0x08,
    Selection = 0x0B,
}

impl CtapCommand {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::MakeCredential),
            0x02 => Some(Self::GetAssertion),
            0x04 => Some(Self::GetInfo),
            0x06 => Some(Self::ClientPin),
            0x07 => Some(Self::Reset),
            0x08 => Some(Self::GetNextAssertion),
            0x0B => Some(Self::Selection),
            _ => None,
        }
    }
}

impl fmt::Display for CtapCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MakeCredential => "MakeCredential",
            Self::GetAssertion => "GetAssertion",
            Self::GetInfo => "GetInfo",
            Self::ClientPin => "ClientPin",
            Self::Reset => "Reset",
            Self::GetNextAssertion => "GetNextAssertion",
            Self::Selection => "Selection",
        };
        write!(f, "{name}(0x{:02x})", self.as_u8())
    }
}

/// Frame a command: opcode followed by the already encoded parameter map
pub fn encode_command(cmd: CtapCommand, params: Option<&[u8]>) -> Vec<u8> {
    let params = params.unwrap_or_default();
    let mut out = Vec::with_capacity(1 + params.len());
    out.push(cmd.as_u8());
    out.extend_from_slice(params);
    out
}

/// A decoded CTAP2 response
///
/// `status` is left as the raw byte; deciding what a failure means is
/// the caller's business.
#[derive(Debug, Clone, PartialEq)]
pub struct CtapResponse {
    pub status: u8,
    pub body: Option<Value>,
}

impl CtapResponse {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Split a response frame into its status byte and decoded body
///
/// The body is only decoded on success; error responses carry no map.
pub fn decode_response(frame: &[u8]) -> Result<CtapResponse> {
    let (&status, rest) = frame.split_first().ok_or(CodecError::EmptyResponse)?;
    let body = if status == 0 && !rest.is_empty() {
        Some(cbor::decode::<Value>(rest)?)
    } else {
        None
    };
    Ok(CtapResponse { status, body })
}
