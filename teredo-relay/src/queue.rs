#![forbid(unsafe_code)]

//! Bounded whole-packet FIFO, one per peer and direction.
//!
//! Packets are held here while a NAT pinhole is being opened and replayed
//! in order once the peer proves reachable. The budget bounds total bytes,
//! not packet count; an insert that would exceed it is rejected (the new
//! packet is dropped, queued ones are kept) so bubble/ping ordering stays
//! deterministic.

use std::collections::VecDeque;

/// Default per-queue byte budget, matching the tunnel MTU.
pub const MAX_QUEUE_BYTES: usize = 1280;

#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Vec<u8>>,
    bytes: usize,
    limit: usize,
}

impl PacketQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_QUEUE_BYTES)
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self { packets: VecDeque::new(), bytes: 0, limit }
    }

    /// Append a whole packet. Returns `false` when the budget would be
    /// exceeded; queued traffic is best-effort so the caller ignores it.
    pub fn queue(&mut self, packet: &[u8]) -> bool {
        if self.bytes + packet.len() > self.limit {
            return false;
        }
        self.bytes += packet.len();
        self.packets.push_back(packet.to_vec());
        true
    }

    /// Drain all queued packets in arrival order for replay.
    pub fn flush(&mut self) -> VecDeque<Vec<u8>> {
        self.bytes = 0;
        std::mem::take(&mut self.packets)
    }

    /// Discard without sending (peer slot recycling).
    pub fn trash(&mut self) {
        self.packets.clear();
        self.bytes = 0;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.bytes
    }
}
