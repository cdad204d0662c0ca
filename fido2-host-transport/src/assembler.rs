//! Response reassembly for a single CTAPHID channel
//!
//! The host only ever waits on one CID at a time. Reports addressed to
//! other channels (another application talking to the same key) are
//! dropped here rather than treated as errors.

use crate::ctaphid::{
    CONT_PACKET_DATA_SIZE, INIT_PACKET_DATA_SIZE, MAX_MESSAGE_SIZE, Message, Packet,
};
use crate::error::{Error, Result};

use std::time::{Duration, Instant};

use smallvec::{SmallVec, smallvec};

/// Continuation packets must follow within this window (CTAPHID transaction timeout)
const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Partially received message
#[derive(Debug)]
struct Pending {
    /// Most CTAP responses fit in four reports
    packets: SmallVec<[Packet; 4]>,
    expected_len: usize,
    received_len: usize,
    next_seq: u8,
    last_packet_at: Instant,
}

impl Pending {
    fn new(init: Packet, expected_len: usize) -> Self {
        Self {
            received_len: expected_len.min(INIT_PACKET_DATA_SIZE),
            packets: smallvec![init],
            expected_len,
            next_seq: 0,
            last_packet_at: Instant::now(),
        }
    }

    fn push(&mut self, packet: Packet) -> Result<()> {
        if self.last_packet_at.elapsed() > TRANSACTION_TIMEOUT {
            return Err(Error::Timeout);
        }
        if packet.seq() != Some(self.next_seq) {
            return Err(Error::InvalidSequence);
        }

        self.received_len += (self.expected_len - self.received_len).min(CONT_PACKET_DATA_SIZE);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.last_packet_at = Instant::now();
        self.packets.push(packet);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.received_len >= self.expected_len
    }
}

/// Reassembles messages arriving on one channel
#[derive(Debug)]
pub struct ResponseAssembler {
    cid: u32,
    pending: Option<Pending>,
}

impl ResponseAssembler {
    pub fn new(cid: u32) -> Self {
        Self { cid, pending: None }
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Feed one report
    ///
    /// Returns `Some(Message)` once a full message for our channel is
    /// available, `None` if more packets are needed or the report was
    /// for another channel.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Message>> {
        if packet.cid() != self.cid {
            tracing::trace!(cid = packet.cid(), "dropping report for foreign channel");
            return Ok(None);
        }

        if packet.is_init() {
            // A fresh init packet aborts whatever was in progress
            let expected_len = packet.payload_len().ok_or(Error::InvalidPacket)? as usize;
            if expected_len > MAX_MESSAGE_SIZE {
                self.pending = None;
                return Err(Error::MessageTooLarge);
            }
            if expected_len <= INIT_PACKET_DATA_SIZE {
                self.pending = None;
                return Message::from_packets(&[packet]).map(Some);
            }
            self.pending = Some(Pending::new(packet, expected_len));
            return Ok(None);
        }

        let Some(pending) = self.pending.as_mut() else {
            tracing::trace!("continuation packet without a transaction, ignoring");
            return Ok(None);
        };

        if let Err(err) = pending.push(packet) {
            self.pending = None;
            return Err(err);
        }

        if !pending.is_complete() {
            return Ok(None);
        }

        match self.pending.take() {
            Some(done) => Message::from_packets(&done.packets).map(Some),
            None => Ok(None),
        }
    }

    /// True while a multi-packet message is half received
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any partially assembled message
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
