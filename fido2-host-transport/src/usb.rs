//! USB HID backend
//!
//! Talks to real security keys through hidapi.

use crate::connection::{DeviceLocation, HidBackend, HidConnection};
use crate::ctaphid::{PACKET_SIZE, Packet};
use crate::error::{Error, Result};

use std::ffi::CString;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};

/// FIDO HID usage page
const FIDO_USAGE_PAGE: u16 = 0xF1D0;

/// FIDO HID usage (CTAPHID)
const FIDO_USAGE: u16 = 0x01;

fn hidapi() -> Result<HidApi> {
    HidApi::new().map_err(|e| Error::Io(format!("failed to initialize HID API: {e}")))
}

/// hidapi-backed [`HidBackend`]
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbBackend;

impl UsbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl HidBackend for UsbBackend {
    fn enumerate(&self) -> Result<Vec<DeviceLocation>> {
        let api = hidapi()?;
        let devices = api
            .device_list()
            .filter(|info| info.usage_page() == FIDO_USAGE_PAGE && info.usage() == FIDO_USAGE)
            .map(|info| DeviceLocation {
                path: info.path().to_string_lossy().into_owned(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                manufacturer: info.manufacturer_string().map(str::to_string),
                product: info.product_string().map(str::to_string),
                serial_number: info.serial_number().map(str::to_string),
            })
            .collect();
        Ok(devices)
    }

    fn open(&self, path: &str) -> Result<Box<dyn HidConnection>> {
        let api = hidapi()?;
        let c_path = CString::new(path)
            .map_err(|_| Error::NotFound(path.to_string()))?;

        if !api.device_list().any(|info| info.path() == c_path.as_c_str()) {
            return Err(Error::NotFound(path.to_string()));
        }

        let device = api
            .open_path(&c_path)
            .map_err(|e| Error::Io(format!("failed to open {path}: {e}")))?;
        tracing::debug!(path, "opened HID device");

        Ok(Box::new(UsbConnection {
            device: Some(device),
        }))
    }
}

/// One open hidapi device
pub struct UsbConnection {
    device: Option<HidDevice>,
}

impl UsbConnection {
    fn device(&self) -> Result<&HidDevice> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::Io("device closed".to_string()))
    }
}

impl HidConnection for UsbConnection {
    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        // hidapi expects the report ID first; FIDO interfaces use ID 0
        let mut report = [0u8; PACKET_SIZE + 1];
        report[1..].copy_from_slice(packet.as_bytes());

        let written = self
            .device()?
            .write(&report)
            .map_err(|e| Error::Io(format!("failed to write report: {e}")))?;

        if written < PACKET_SIZE {
            return Err(Error::Io(format!(
                "incomplete write: {written} of {} bytes",
                report.len()
            )));
        }
        Ok(())
    }

    fn read_packet(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        let mut buf = [0u8; PACKET_SIZE];
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let read = self
            .device()?
            .read_timeout(&mut buf, timeout_ms)
            .map_err(|e| Error::Io(format!("failed to read report: {e}")))?;

        match read {
            0 => Ok(None),
            PACKET_SIZE => Packet::from_slice(&buf).map(Some),
            n => Err(Error::Io(format!(
                "incomplete read: {n} bytes (expected {PACKET_SIZE})"
            ))),
        }
    }

    fn close(&mut self) {
        self.device = None;
    }
}
