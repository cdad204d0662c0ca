//! FIDO2 client: device discovery and opening

use crate::config::ClientConfig;
use crate::device::Device;
use crate::error::Result;
use crate::transport::HidLink;

use fido2_host_transport::{DeviceLocation, HidBackend, PathClaim};

use std::sync::Arc;

/// Entry point: finds authenticators and opens them
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn HidBackend>,
    config: ClientConfig,
}

impl Client {
    /// Client over the system's USB HID devices
    #[cfg(feature = "usb")]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_backend(fido2_host_transport::UsbBackend::new(), config)
    }

    /// Client over any HID backend (a simulated authenticator, say)
    pub fn with_backend(backend: impl HidBackend + 'static, config: ClientConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Lazily enumerate attached authenticators
    pub fn discover(&self) -> Discovery {
        Discovery {
            backend: Arc::clone(&self.backend),
            pending: None,
        }
    }

    /// Claim and open a device; no traffic is sent until the first operation
    pub fn open(&self, location: &DeviceLocation) -> Result<Device> {
        let claim = PathClaim::acquire(&location.path)?;
        let conn = self.backend.open(&location.path)?;
        tracing::debug!(path = %location.path, "opened device");
        Ok(Device::new(
            HidLink::new(location.clone(), conn, claim),
            self.config,
        ))
    }

    /// Open by path, using the enumerated location when the backend lists it
    pub fn open_path(&self, path: &str) -> Result<Device> {
        let location = self
            .backend
            .enumerate()
            .ok()
            .and_then(|found| found.into_iter().find(|loc| loc.path == path))
            .unwrap_or_else(|| DeviceLocation {
                path: path.to_string(),
                ..DeviceLocation::default()
            });
        self.open(&location)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish()
    }
}

/// Device enumeration, run on first use and again after [`restart`](Self::restart)
///
/// Enumeration failures are logged and yield nothing: no devices is not an error.
pub struct Discovery {
    backend: Arc<dyn HidBackend>,
    pending: Option<std::vec::IntoIter<DeviceLocation>>,
}

impl Discovery {
    /// Forget the current snapshot; the next `next()` enumerates again
    pub fn restart(&mut self) {
        self.pending = None;
    }
}

impl Iterator for Discovery {
    type Item = DeviceLocation;

    fn next(&mut self) -> Option<Self::Item> {
        let backend = &self.backend;
        self.pending
            .get_or_insert_with(|| match backend.enumerate() {
                Ok(found) => {
                    tracing::debug!(count = found.len(), "enumerated devices");
                    found.into_iter()
                }
                Err(err) => {
                    tracing::warn!(error = %err, "device enumeration failed");
                    Vec::new().into_iter()
                }
            })
            .next()
    }
}
