#![forbid(unsafe_code)]

//! Per-peer NAT traversal state and the directory that owns it.
//!
//! Each record tracks the endpoint a NAT is believed to substitute for a
//! peer, trust/negotiation flags, and the packets queued while the pinhole
//! is opened. Records expire after 30 s of (one-sided) silence; expired
//! slots are recycled on the next allocation instead of being collected
//! eagerly.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use teredo_core::{TeredoError, TeredoResult};

use crate::queue::PacketQueue;

/// Peer inactivity timeout.
pub const TEREDO_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory bound; the oldest-expiring record is evicted when full.
pub const MAX_PEERS: usize = 1024;

/// Negotiation flags. `bubbles` and `pings` saturate at 3 per peer
/// lifetime; `nonce` is meaningful only while `nonce_pending`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// Mapping confirmed; forward directly.
    pub trusted: bool,
    /// At least one packet received from this peer.
    pub replied: bool,
    /// A ping nonce is outstanding.
    pub nonce_pending: bool,
    /// Bubbles sent (0..=3).
    pub bubbles: u8,
    /// Connectivity pings sent (0..=3).
    pub pings: u8,
}

#[derive(Debug)]
pub struct Peer {
    pub addr: Ipv6Addr,
    pub mapped_ip: Ipv4Addr,
    pub mapped_port: u16,
    pub flags: PeerFlags,
    pub nonce: [u8; 8],
    pub outqueue: PacketQueue,
    pub inqueue: PacketQueue,
    expiry: Instant,
}

impl Peer {
    fn new(addr: Ipv6Addr, now: Instant) -> Self {
        Self {
            addr,
            mapped_ip: Ipv4Addr::UNSPECIFIED,
            mapped_port: 0,
            flags: PeerFlags::default(),
            nonce: [0; 8],
            outqueue: PacketQueue::new(),
            inqueue: PacketQueue::new(),
            expiry: now + TEREDO_TIMEOUT,
        }
    }

    /// Recycle in place: queues trashed, flags and mapping cleared.
    fn reset(&mut self, now: Instant) {
        self.outqueue.trash();
        self.inqueue.trash();
        self.mapped_ip = Ipv4Addr::UNSPECIFIED;
        self.mapped_port = 0;
        self.flags = PeerFlags::default();
        self.nonce = [0; 8];
        self.expiry = now + TEREDO_TIMEOUT;
    }

    pub fn set_mapping(&mut self, ip: Ipv4Addr, port: u16) {
        self.mapped_ip = ip;
        self.mapped_port = port;
    }

    /// NAT-external endpoint believed to reach this peer.
    #[must_use]
    pub fn mapped(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.mapped_ip, self.mapped_port))
    }

    /// Any reception refreshes the expiry window and proves reachability.
    pub fn touch_receive(&mut self, now: Instant) {
        self.flags.replied = true;
        self.expiry = now + TEREDO_TIMEOUT;
    }

    /// Transmissions refresh the window only until the peer has replied:
    /// each outbound attempt restarts the handshake deadline, but activity
    /// toward a proven-silent peer must not keep the record alive forever.
    pub fn touch_transmit(&mut self, now: Instant) {
        if !self.flags.replied {
            self.expiry = now + TEREDO_TIMEOUT;
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiry
    }

    #[cfg(test)]
    pub(crate) fn expires_at(&self) -> Instant {
        self.expiry
    }
}

/// Peer records keyed by IPv6 address. At most one non-expired record per
/// address exists at any time.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: HashMap<Ipv6Addr, Peer>,
    capacity: usize,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_PEERS)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { peers: HashMap::new(), capacity }
    }

    /// First non-expired record for `addr`, if any.
    pub fn find(&mut self, addr: &Ipv6Addr, now: Instant) -> Option<&mut Peer> {
        match self.peers.get_mut(addr) {
            Some(p) if !p.is_expired(now) => Some(p),
            _ => None,
        }
    }

    /// Create-or-recycle a record for `addr`. An existing (expired) slot
    /// under the same address is emptied and reused; otherwise one expired
    /// slot elsewhere is reclaimed before inserting. At capacity the
    /// record with the earliest expiry is evicted.
    pub fn allocate(&mut self, addr: Ipv6Addr, now: Instant) -> TeredoResult<&mut Peer> {
        if let Some(p) = self.peers.get_mut(&addr) {
            p.reset(now);
        } else {
            if let Some(k) = self
                .peers
                .iter()
                .find(|(_, p)| p.is_expired(now))
                .map(|(k, _)| *k)
            {
                self.peers.remove(&k);
            }
            if self.peers.len() >= self.capacity {
                let victim = self
                    .peers
                    .iter()
                    .min_by_key(|(_, p)| p.expiry)
                    .map(|(k, _)| *k);
                match victim {
                    Some(k) => {
                        self.peers.remove(&k);
                    }
                    None => return Err(TeredoError::Exhausted),
                }
            }
            self.peers.insert(addr, Peer::new(addr, now));
        }
        self.peers.get_mut(&addr).ok_or(TeredoError::Exhausted)
    }

    /// Bulk release at shutdown.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
