//! CTAPHID framing
//!
//! Splits outgoing messages into 64-byte HID reports and parses the
//! authenticator's replies.
//!
//! Packet Format:
//! - Initialization packet: CID(4) + CMD(1) + BCNT(2) + DATA(57)
//! - Continuation packet: CID(4) + SEQ(1) + DATA(59)
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#usb-hid-framing>

use crate::error::{Error, Result};

use bitflags::bitflags;

/// HID report size (fixed at 64 bytes for USB HID)
pub const PACKET_SIZE: usize = 64;

/// Maximum CTAPHID message size (57 + 128 * 59 bytes)
pub const MAX_MESSAGE_SIZE: usize = 7609;

/// Broadcast channel ID, only valid for INIT
pub const BROADCAST_CID: u32 = 0xFFFFFFFF;

/// Length of the INIT nonce
pub const INIT_NONCE_SIZE: usize = 8;

/// Length of a well-formed INIT response payload
const INIT_RESPONSE_SIZE: usize = 17;

pub(crate) const INIT_PACKET_DATA_SIZE: usize = PACKET_SIZE - 7;
pub(crate) const CONT_PACKET_DATA_SIZE: usize = PACKET_SIZE - 5;

/// CTAPHID commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Echo the payload back
    Ping = 0x01,

    /// Encapsulated CTAP1/U2F message
    Msg = 0x03,

    /// Place an exclusive lock for one channel
    Lock = 0x04,

    /// Allocate a new CID or synchronize channel
    Init = 0x06,

    /// Ask the authenticator to identify itself (blink, beep)
    Wink = 0x08,

    /// Encapsulated CTAP2 CBOR message
    Cbor = 0x10,

    /// Cancel the outstanding request on this CID
    Cancel = 0x11,

    /// Request still being processed
    Keepalive = 0x3B,

    /// Error response
    Error = 0x3F,
}

impl Cmd {
    /// Parse a command byte, ignoring the TYPE bit
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x7F {
            0x01 => Some(Cmd::Ping),
            0x03 => Some(Cmd::Msg),
            0x04 => Some(Cmd::Lock),
            0x06 => Some(Cmd::Init),
            0x08 => Some(Cmd::Wink),
            0x10 => Some(Cmd::Cbor),
            0x11 => Some(Cmd::Cancel),
            0x3B => Some(Cmd::Keepalive),
            0x3F => Some(Cmd::Error),
            _ => None,
        }
    }

    /// Command byte with the TYPE bit set, as written in an init packet
    pub fn to_u8_init(self) -> u8 {
        (self as u8) | 0x80
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Error codes carried by a CTAPHID_ERROR response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidErrorCode {
    InvalidCmd,
    InvalidPar,
    InvalidLen,
    InvalidSeq,
    MsgTimeout,
    ChannelBusy,
    LockRequired,
    InvalidChannel,
    Other(u8),
}

impl HidErrorCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::InvalidCmd,
            0x02 => Self::InvalidPar,
            0x03 => Self::InvalidLen,
            0x04 => Self::InvalidSeq,
            0x05 => Self::MsgTimeout,
            0x06 => Self::ChannelBusy,
            0x0A => Self::LockRequired,
            0x0B => Self::InvalidChannel,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::InvalidCmd => 0x01,
            Self::InvalidPar => 0x02,
            Self::InvalidLen => 0x03,
            Self::InvalidSeq => 0x04,
            Self::MsgTimeout => 0x05,
            Self::ChannelBusy => 0x06,
            Self::LockRequired => 0x0A,
            Self::InvalidChannel => 0x0B,
            Self::Other(code) => code,
        }
    }
}

/// Status byte of a CTAPHID_KEEPALIVE frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveStatus {
    /// Authenticator is still working on the request
    Processing,
    /// Authenticator is waiting for the user to touch it
    UpNeeded,
    /// Status byte not defined by CTAP 2.1
    Unknown(u8),
}

impl KeepaliveStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Processing,
            2 => Self::UpNeeded,
            other => Self::Unknown(other),
        }
    }
}

bitflags! {
    /// Capability flags advertised in the INIT response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        /// Implements CTAPHID_WINK
        const WINK = 0x01;
        /// Implements CTAPHID_CBOR (CTAP2)
        const CBOR = 0x04;
        /// Does not implement CTAPHID_MSG (no CTAP1/U2F)
        const NMSG = 0x08;
    }
}

/// Decoded CTAPHID_INIT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitResponse {
    /// Channel allocated for us
    pub cid: u32,
    /// CTAPHID protocol version (2 for current devices)
    pub protocol_version: u8,
    /// Device major, minor and build version
    pub device_version: (u8, u8, u8),
    pub capabilities: Capabilities,
}

impl InitResponse {
    /// Parse an INIT response, checking it answers our nonce
    ///
    /// Returns `Ok(None)` when the nonce belongs to someone else's INIT.
    pub fn parse(payload: &[u8], nonce: &[u8; INIT_NONCE_SIZE]) -> Result<Option<Self>> {
        if payload.len() < INIT_RESPONSE_SIZE {
            return Err(Error::InvalidPacket);
        }
        if payload[..INIT_NONCE_SIZE] != nonce[..] {
            return Ok(None);
        }

        let cid = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
        if cid == 0 || cid == BROADCAST_CID {
            return Err(Error::InvalidChannel);
        }

        Ok(Some(Self {
            cid,
            protocol_version: payload[12],
            device_version: (payload[13], payload[14], payload[15]),
            capabilities: Capabilities::from_bits_truncate(payload[16]),
        }))
    }
}

/// A single 64-byte HID report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: [u8; PACKET_SIZE],
}

impl Packet {
    pub fn from_bytes(data: [u8; PACKET_SIZE]) -> Self {
        Self { data }
    }

    /// Build a packet from a slice, which must be exactly 64 bytes
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let data: [u8; PACKET_SIZE] = data.try_into().map_err(|_| Error::InvalidPacket)?;
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.data
    }

    pub fn cid(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    pub fn is_init(&self) -> bool {
        (self.data[4] & 0x80) != 0
    }

    /// Command byte (init packets only)
    pub fn cmd(&self) -> Option<Cmd> {
        if !self.is_init() {
            return None;
        }
        Cmd::from_u8(self.data[4])
    }

    /// Declared message length (init packets only)
    pub fn payload_len(&self) -> Option<u16> {
        if !self.is_init() {
            return None;
        }
        Some(u16::from_be_bytes([self.data[5], self.data[6]]))
    }

    /// Sequence number (continuation packets only)
    pub fn seq(&self) -> Option<u8> {
        if self.is_init() {
            return None;
        }
        Some(self.data[4])
    }

    pub fn payload(&self) -> &[u8] {
        if self.is_init() {
            &self.data[7..]
        } else {
            &self.data[5..]
        }
    }

    /// Fragment `data` into an init packet and as many continuation packets as needed
    pub fn fragment(cid: u32, cmd: Cmd, data: &[u8]) -> Result<Vec<Self>> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }

        let mut init = [0u8; PACKET_SIZE];
        init[0..4].copy_from_slice(&cid.to_be_bytes());
        init[4] = cmd.to_u8_init();
        init[5..7].copy_from_slice(&(data.len() as u16).to_be_bytes());

        let head = data.len().min(INIT_PACKET_DATA_SIZE);
        init[7..7 + head].copy_from_slice(&data[..head]);

        let mut packets = vec![Packet::from_bytes(init)];
        for (seq, chunk) in data[head..].chunks(CONT_PACKET_DATA_SIZE).enumerate() {
            let mut cont = [0u8; PACKET_SIZE];
            cont[0..4].copy_from_slice(&cid.to_be_bytes());
            cont[4] = seq as u8;
            cont[5..5 + chunk.len()].copy_from_slice(chunk);
            packets.push(Packet::from_bytes(cont));
        }

        Ok(packets)
    }
}

/// A complete CTAPHID message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cid: u32,
    pub cmd: Cmd,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(cid: u32, cmd: Cmd, data: Vec<u8>) -> Self {
        Self { cid, cmd, data }
    }

    pub fn to_packets(&self) -> Result<Vec<Packet>> {
        Packet::fragment(self.cid, self.cmd, &self.data)
    }

    /// Reassemble a message from an ordered list of packets
    pub fn from_packets(packets: &[Packet]) -> Result<Self> {
        let (init, rest) = packets.split_first().ok_or(Error::InvalidPacket)?;
        if !init.is_init() {
            return Err(Error::InvalidPacket);
        }

        let cid = init.cid();
        let cmd = init.cmd().ok_or(Error::InvalidCommand)?;
        let total_len = init.payload_len().ok_or(Error::InvalidPacket)? as usize;
        if total_len > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }

        let mut data = Vec::with_capacity(total_len);
        let head = total_len.min(INIT_PACKET_DATA_SIZE);
        data.extend_from_slice(&init.payload()[..head]);

        for (expected_seq, packet) in rest.iter().enumerate() {
            if data.len() == total_len {
                break;
            }
            if packet.cid() != cid {
                return Err(Error::InvalidChannel);
            }
            if packet.seq() != Some(expected_seq as u8) {
                return Err(Error::InvalidSequence);
            }
            let take = (total_len - data.len()).min(CONT_PACKET_DATA_SIZE);
            data.extend_from_slice(&packet.payload()[..take]);
        }

        if data.len() != total_len {
            return Err(Error::FragmentationError);
        }

        Ok(Message { cid, cmd, data })
    }

    /// Keepalive status, if this is a keepalive frame
    pub fn keepalive_status(&self) -> Option<KeepaliveStatus> {
        match (self.cmd, self.data.first()) {
            (Cmd::Keepalive, Some(&status)) => Some(KeepaliveStatus::from_u8(status)),
            _ => None,
        }
    }

    /// HID error code, if this is an error frame
    pub fn error_code(&self) -> Option<HidErrorCode> {
        match (self.cmd, self.data.first()) {
            (Cmd::Error, Some(&code)) => Some(HidErrorCode::from_u8(code)),
            (Cmd::Error, None) => Some(HidErrorCode::Other(0)),
            _ => None,
        }
    }
}
