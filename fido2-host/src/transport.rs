//! CTAPHID link to one authenticator
//!
//! Owns the open connection and the path claim, allocates a channel with
//! CTAPHID_INIT on first use, and moves whole messages. The command
//! session drives reads; this type only knows how to talk CTAPHID.

use crate::config::ClientConfig;
use crate::error::{Error, Result};

use fido2_host_transport::ctaphid::INIT_NONCE_SIZE;
use fido2_host_transport::{
    BROADCAST_CID, Capabilities, Cmd, DeviceLocation, HidConnection, InitResponse, Message, Packet,
    PathClaim, ResponseAssembler,
};

use std::time::{Duration, Instant};

/// Upper bound on stale reports discarded before a command
const MAX_FLUSHED_REPORTS: usize = 64;

pub(crate) struct HidLink {
    location: DeviceLocation,
    conn: Box<dyn HidConnection>,
    channel: Option<InitResponse>,
    /// Set when a command was abandoned mid-response; forces a fresh INIT
    needs_resync: bool,
    _claim: PathClaim,
}

impl HidLink {
    pub(crate) fn new(location: DeviceLocation, conn: Box<dyn HidConnection>, claim: PathClaim) -> Self {
        Self {
            location,
            conn,
            channel: None,
            needs_resync: false,
            _claim: claim,
        }
    }

    pub(crate) fn location(&self) -> &DeviceLocation {
        &self.location
    }

    /// Channel parameters, running INIT if we have none yet
    pub(crate) fn channel(&mut self, config: &ClientConfig) -> Result<InitResponse> {
        match self.channel {
            Some(init) if !self.needs_resync => Ok(init),
            _ => {
                let init = self.init_channel(config.init_timeout)?;
                self.channel = Some(init);
                self.needs_resync = false;
                Ok(init)
            }
        }
    }

    pub(crate) fn capabilities(&mut self, config: &ClientConfig) -> Result<Capabilities> {
        Ok(self.channel(config)?.capabilities)
    }

    pub(crate) fn mark_resync(&mut self) {
        self.needs_resync = true;
    }

    /// Allocate a channel on the broadcast CID
    fn init_channel(&mut self, timeout: Duration) -> Result<InitResponse> {
        let nonce: [u8; INIT_NONCE_SIZE] = rand::random();
        self.flush_input()?;
        self.send(BROADCAST_CID, Cmd::Init, &nonce)?;

        let deadline = Instant::now() + timeout;
        let mut assembler = ResponseAssembler::new(BROADCAST_CID);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!(path = %self.location.path, "no reply to CTAPHID_INIT");
                return Err(Error::TimedOut);
            }

            let Some(packet) = self.conn.read_packet(remaining)? else {
                continue;
            };
            let Some(message) = assembler.push(packet)? else {
                continue;
            };
            if message.cmd != Cmd::Init {
                continue;
            }

            // Another client's INIT reply carries a different nonce
            if let Some(init) = InitResponse::parse(&message.data, &nonce)? {
                tracing::debug!(
                    cid = format_args!("{:08x}", init.cid),
                    caps = ?init.capabilities,
                    version = ?init.device_version,
                    "allocated CTAPHID channel"
                );
                return Ok(init);
            }
        }
    }

    /// Write one message, fragmented into reports
    pub(crate) fn send(&mut self, cid: u32, cmd: Cmd, data: &[u8]) -> Result<()> {
        for packet in &Message::new(cid, cmd, data.to_vec()).to_packets()? {
            self.conn.write_packet(packet)?;
        }
        Ok(())
    }

    pub(crate) fn send_cancel(&mut self, cid: u32) -> Result<()> {
        tracing::debug!(cid = format_args!("{:08x}", cid), "sending CTAPHID_CANCEL");
        self.send(cid, Cmd::Cancel, &[])
    }

    pub(crate) fn read_packet(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        Ok(self.conn.read_packet(timeout)?)
    }

    /// Discard reports left over from an earlier exchange
    pub(crate) fn flush_input(&mut self) -> Result<()> {
        for _ in 0..MAX_FLUSHED_REPORTS {
            match self.conn.read_packet(Duration::ZERO)? {
                Some(packet) => tracing::trace!(cid = packet.cid(), "discarding stale report"),
                None => return Ok(()),
            }
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        tracing::debug!(path = %self.location.path, "closing device");
        self.channel = None;
        self.conn.close();
    }
}
