//! Client configuration

use std::time::Duration;

/// Timing knobs for talking to authenticators
///
/// Every read against a device is bounded by `poll_interval`; the other
/// values bound how long an operation may go without progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Longest single wait on the HID read; cancellation is noticed at this granularity
    pub poll_interval: Duration,

    /// Longest silence (no keepalive, no response) before a command is abandoned
    pub frame_timeout: Duration,

    /// Overall deadline for one operation, including time spent waiting for touch
    pub operation_timeout: Duration,

    /// How long to wait for the device to acknowledge a cancel
    pub cancel_drain_timeout: Duration,

    /// How long to wait for a CTAPHID_INIT reply
    pub init_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            frame_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            cancel_drain_timeout: Duration::from_secs(2),
            init_timeout: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_cancel_drain_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_drain_timeout = timeout;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }
}
