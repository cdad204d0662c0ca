//! Command session: one request, one final response
//!
//! ```text
//! Idle ──write──▶ Sent ──accepted──▶ AwaitingResponse ─┬─▶ Completed
//!                                        │   ▲         ├─▶ Failed
//!                                   keepalive│         ├─▶ Cancelled
//!                                        └───┘         └─▶ TimedOut
//! ```
//!
//! While awaiting, the session polls the link with a short bounded read
//! and checks its [`CancelToken`] between reads. A cancel (or a blown
//! deadline) sends CTAPHID_CANCEL once and then keeps reading until the
//! device's final frame arrives, so nothing is left in the pipe for the
//! next command.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::HidLink;

use fido2_host_ctap::StatusCode;
use fido2_host_transport::{Cmd, HidErrorCode, KeepaliveStatus, Message, ResponseAssembler};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Signal that asks a running session to stop
///
/// Clones share one flag. Signalling after the session finished has no
/// effect on its result.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Receives keepalive frames while a command is pending
///
/// All statuses mean the same thing to the session (keep waiting); an
/// observer can use `UpNeeded` to prompt for a touch.
pub trait KeepaliveObserver: Send + Sync {
    fn keepalive(&self, status: KeepaliveStatus);
}

impl<F> KeepaliveObserver for F
where
    F: Fn(KeepaliveStatus) + Send + Sync,
{
    fn keepalive(&self, status: KeepaliveStatus) {
        self(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sent,
    AwaitingResponse,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Why we asked the device to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    TimedOut,
}

impl Abort {
    fn state(self) -> SessionState {
        match self {
            Abort::Cancelled => SessionState::Cancelled,
            Abort::TimedOut => SessionState::TimedOut,
        }
    }

    fn error(self) -> Error {
        match self {
            Abort::Cancelled => Error::Cancelled,
            Abort::TimedOut => Error::TimedOut,
        }
    }
}

pub(crate) struct CommandSession<'a> {
    link: &'a mut HidLink,
    config: &'a ClientConfig,
    token: &'a CancelToken,
    observer: Option<&'a dyn KeepaliveObserver>,
    deadline: Instant,
    state: SessionState,
}

impl<'a> CommandSession<'a> {
    pub(crate) fn new(
        link: &'a mut HidLink,
        config: &'a ClientConfig,
        token: &'a CancelToken,
        deadline: Instant,
    ) -> Self {
        Self {
            link,
            config,
            token,
            observer: None,
            deadline,
            state: SessionState::Idle,
        }
    }

    pub(crate) fn with_observer(mut self, observer: Option<&'a dyn KeepaliveObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Send `payload` as `cmd` and wait for the matching final frame
    ///
    /// On success returns the response payload. For CTAPHID_CBOR a nonzero
    /// leading status byte still counts as a response here; the state is
    /// `Failed` and interpretation is left to the caller.
    pub(crate) fn transact(&mut self, cmd: Cmd, payload: &[u8]) -> Result<Vec<u8>> {
        let result = self.run(cmd, payload);
        if let Err(err) = &result
            && !self.state.is_terminal()
        {
            tracing::debug!(error = %err, "session failed");
            self.link.mark_resync();
            self.transition(SessionState::Failed);
        }
        result
    }

    fn run(&mut self, cmd: Cmd, payload: &[u8]) -> Result<Vec<u8>> {
        if self.token.is_cancelled() {
            self.transition(SessionState::Cancelled);
            return Err(Error::Cancelled);
        }

        let cid = self.link.channel(self.config)?.cid;
        self.link.flush_input()?;
        self.link.send(cid, cmd, payload)?;
        self.transition(SessionState::Sent);
        self.transition(SessionState::AwaitingResponse);

        let mut assembler = ResponseAssembler::new(cid);
        let mut last_frame = Instant::now();
        let mut abort: Option<(Abort, Instant)> = None;

        loop {
            let now = Instant::now();
            match abort {
                None => {
                    let reason = if self.token.is_cancelled() {
                        Some(Abort::Cancelled)
                    } else if now >= self.deadline
                        || now.duration_since(last_frame) >= self.config.frame_timeout
                    {
                        Some(Abort::TimedOut)
                    } else {
                        None
                    };
                    if let Some(reason) = reason {
                        tracing::debug!(?reason, "aborting command");
                        self.link.send_cancel(cid)?;
                        abort = Some((reason, now));
                    }
                }
                Some((reason, sent_at)) => {
                    if now.duration_since(sent_at) >= self.config.cancel_drain_timeout {
                        // Device never acknowledged; start the next command on a fresh channel
                        tracing::warn!("device did not acknowledge cancel");
                        self.link.mark_resync();
                        self.transition(reason.state());
                        return Err(reason.error());
                    }
                }
            }

            let Some(packet) = self.link.read_packet(self.config.poll_interval)? else {
                continue;
            };
            let Some(message) = assembler.push(packet)? else {
                continue;
            };
            last_frame = Instant::now();

            match message.cmd {
                Cmd::Keepalive => {
                    let status = message
                        .keepalive_status()
                        .unwrap_or(KeepaliveStatus::Unknown(0));
                    tracing::trace!(?status, "keepalive");
                    if let Some(observer) = self.observer {
                        observer.keepalive(status);
                    }
                }
                Cmd::Error => return Err(self.hid_error(&message)),
                c if c == cmd => return self.finish(message, abort.map(|(reason, _)| reason)),
                other => {
                    tracing::debug!(cmd = ?other, "ignoring unexpected frame");
                }
            }
        }
    }

    fn finish(&mut self, message: Message, abort: Option<Abort>) -> Result<Vec<u8>> {
        let status = match message.cmd {
            Cmd::Cbor => message.data.first().copied(),
            _ => Some(0),
        };

        match (abort, status) {
            (Some(reason), Some(code)) if code == StatusCode::KeepaliveCancel.to_u8() => {
                self.transition(reason.state());
                Err(reason.error())
            }
            // A result that beat the cancel stands
            (_, Some(0)) => {
                self.transition(SessionState::Completed);
                Ok(message.data)
            }
            _ => {
                self.transition(SessionState::Failed);
                Ok(message.data)
            }
        }
    }

    fn hid_error(&mut self, message: &Message) -> Error {
        match message.error_code() {
            Some(HidErrorCode::ChannelBusy) => {
                fido2_host_transport::Error::Busy(self.link.location().path.clone()).into()
            }
            Some(HidErrorCode::InvalidChannel) => {
                self.link.mark_resync();
                Error::Protocol("device rejected channel".to_string())
            }
            code => Error::Protocol(format!("CTAPHID error {code:?}")),
        }
    }
}
