//! Background wait for a touch
//!
//! ```text
//! Running ──probe returns──▶ Finished(result) ──stop──▶ Stopped
//!    └──────────────────────stop───────────────────────────▲
//! ```

use crate::device::Device;
use crate::error::{Error, Result};
use crate::session::CancelToken;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug)]
enum TouchState {
    Running,
    Finished(Result<()>),
    /// Probe outcome once stopped; a probe stopped before finishing is `Cancelled`
    Stopped(Result<()>),
}

#[derive(Debug)]
struct TouchShared {
    state: Mutex<TouchState>,
    changed: Condvar,
}

impl TouchShared {
    fn lock(&self) -> MutexGuard<'_, TouchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running touch probe, from [`Device::begin_touch`]
///
/// Dropping the handle stops the probe.
#[derive(Debug)]
pub struct TouchHandle {
    shared: Arc<TouchShared>,
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl TouchHandle {
    pub(crate) fn spawn(device: Device) -> Result<Self> {
        let shared = Arc::new(TouchShared {
            state: Mutex::new(TouchState::Running),
            changed: Condvar::new(),
        });
        let token = CancelToken::new();

        let thread = {
            let shared = Arc::clone(&shared);
            let token = token.clone();
            thread::Builder::new()
                .name(format!("fido2-touch {}", device.path()))
                .spawn(move || {
                    let result = device.touch_probe(token);
                    tracing::debug!(ok = result.is_ok(), "touch probe finished");

                    let mut state = shared.lock();
                    if matches!(*state, TouchState::Running) {
                        *state = TouchState::Finished(result);
                    }
                    shared.changed.notify_all();
                })
                .map_err(|err| Error::Transport(err.into()))?
        };

        Ok(Self {
            shared,
            token,
            thread: Some(thread),
        })
    }

    /// Wait up to `timeout` for the touch
    ///
    /// `Ok(false)` means not yet; the probe keeps running. An error means
    /// the probe ended without a touch (device timeout, unplug, stop).
    pub fn status(&self, timeout: Duration) -> Result<bool> {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| matches!(s, TouchState::Running))
            .unwrap_or_else(PoisonError::into_inner);

        match &*state {
            TouchState::Running => Ok(false),
            TouchState::Finished(Ok(())) | TouchState::Stopped(Ok(())) => Ok(true),
            TouchState::Finished(Err(err)) | TouchState::Stopped(Err(err)) => Err(err.clone()),
        }
    }

    /// Stop the probe and wait for its thread
    ///
    /// Safe to call any number of times, before or after completion.
    pub fn stop(&mut self) -> Result<()> {
        self.token.cancel();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("touch probe thread panicked");
        }

        let mut state = self.shared.lock();
        let outcome = match std::mem::replace(&mut *state, TouchState::Running) {
            TouchState::Running => Err(Error::Cancelled),
            TouchState::Finished(result) | TouchState::Stopped(result) => result,
        };
        *state = TouchState::Stopped(outcome);
        self.shared.changed.notify_all();
        Ok(())
    }
}

impl Drop for TouchHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
