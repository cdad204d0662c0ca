//! Transport Channel abstraction
//!
//! A backend enumerates FIDO HID interfaces and opens them; a connection
//! moves raw 64-byte reports. Everything above this (framing, channels,
//! CTAP) is backend independent.

use crate::ctaphid::Packet;
use crate::error::Result;

use std::time::Duration;

/// Where a FIDO HID interface can be found
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceLocation {
    /// Transport-specific path, passed back to [`HidBackend::open`]
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// An open HID interface
pub trait HidConnection: Send {
    /// Write one report
    fn write_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Read one report, waiting at most `timeout`
    ///
    /// `Ok(None)` means nothing arrived in time.
    fn read_packet(&mut self, timeout: Duration) -> Result<Option<Packet>>;

    /// Release the OS handle. Further calls may fail.
    fn close(&mut self) {}
}

/// Source of HID connections
pub trait HidBackend: Send + Sync {
    /// List FIDO interfaces currently attached
    fn enumerate(&self) -> Result<Vec<DeviceLocation>>;

    /// Open the interface at `path`
    fn open(&self, path: &str) -> Result<Box<dyn HidConnection>>;
}
