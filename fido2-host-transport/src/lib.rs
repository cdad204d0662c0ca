//! CTAPHID transport for FIDO2 host clients
//!
//! This crate provides the lowest layer of the host stack:
//! - CTAPHID framing (fragmentation, reassembly, INIT/KEEPALIVE/ERROR frames)
//! - A [`HidBackend`]/[`HidConnection`] abstraction over raw 64-byte reports
//! - Process-wide exclusive claims on device paths
//! - A hidapi-based USB backend (feature `usb`)
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#usb>

pub mod assembler;
pub mod claim;
pub mod connection;
pub mod ctaphid;
pub mod error;
#[cfg(feature = "usb")]
pub mod usb;

pub use assembler::ResponseAssembler;
pub use claim::PathClaim;
pub use connection::{DeviceLocation, HidBackend, HidConnection};
pub use ctaphid::{
    BROADCAST_CID, Capabilities, Cmd, HidErrorCode, InitResponse, KeepaliveStatus, Message, Packet,
};
pub use error::{Error, Result};
#[cfg(feature = "usb")]
pub use usb::{UsbBackend, UsbConnection};
