#![forbid(unsafe_code)]

//! Per-packet decision logic of the tunnel (RFC 4380 §5.2.4/§5.4).
//!
//! Every IPv6 packet leaving the local stack goes through [`TeredoTunnel::transmit`]
//! ("packet transmission") and every UDP datagram arriving on the Teredo
//! socket goes through [`TeredoTunnel::receive`] ("packet reception"). Both
//! paths consult the peer directory to decide whether to forward, queue
//! behind a pending NAT handshake, probe, or drop. All sends are
//! best-effort and non-blocking; nothing here waits on the network.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use teredo_core::addr::{
    self, TeredoAddr, LINK_LOCAL_CONE, LINK_LOCAL_RESTRICT, TEREDO_FLAG_CONE, TEREDO_PORT,
};
use teredo_core::TeredoResult;

use crate::maintenance::{ProbeState, QualState, QualificationParams};
use crate::packet;
use crate::peer::{Peer, PeerDirectory};

/// Consumer of decapsulated IPv6 packets (the tunnel-interface driver).
#[async_trait]
pub trait Ipv6Sink: Send + Sync + 'static {
    async fn deliver(&self, packet: &[u8]);
}

/// Consumer of locally generated ICMPv6 errors (raw-socket emitter).
#[async_trait]
pub trait IcmpSink: Send + Sync + 'static {
    async fn send_error(&self, packet: &[u8], dst: &Ipv6Addr);
}

/// Lifecycle notifications from the qualification machine.
pub trait StateHandler: Send + Sync + 'static {
    fn on_up(&self, addr: Ipv6Addr, mtu: u16);
    fn on_down(&self);
}

/// Operating mode, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Relay serving a fixed prefix; statically qualified.
    Relay { prefix: u32 },
    /// Client qualifying against a server (and its secondary address).
    Client { server: Ipv4Addr, server2: Ipv4Addr },
}

fn read_ipv6(buf: &[u8], off: usize) -> Ipv6Addr {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[off..off + 16]);
    Ipv6Addr::from(b)
}

pub struct TeredoTunnel {
    mode: Mode,
    ignore_cone: bool,
    params: QualificationParams,
    out: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    peers: AsyncMutex<PeerDirectory>,
    qual: Mutex<QualState>,
    /// Signalled after a nonce-matched advertisement updated `qual`.
    pub(crate) ra_received: Notify,
    sink: Arc<dyn Ipv6Sink>,
    icmp: Arc<dyn IcmpSink>,
    state_cb: Arc<dyn StateHandler>,
}

impl TeredoTunnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: Mode,
        cone: bool,
        ignore_cone: bool,
        params: QualificationParams,
        out: mpsc::Sender<(SocketAddr, Vec<u8>)>,
        sink: Arc<dyn Ipv6Sink>,
        icmp: Arc<dyn IcmpSink>,
        state_cb: Arc<dyn StateHandler>,
    ) -> Arc<Self> {
        let qual = match mode {
            Mode::Relay { prefix } => QualState {
                state: ProbeState::Qualified,
                cone,
                nonce: [0; 8],
                addr: TeredoAddr {
                    prefix,
                    server: Ipv4Addr::UNSPECIFIED,
                    flags: if cone { TEREDO_FLAG_CONE } else { 0 },
                    client_port: 0,
                    client_ip: Ipv4Addr::UNSPECIFIED,
                },
                mtu: packet::TUNNEL_MTU as u16,
                symmetric: false,
            },
            Mode::Client { server, server2 } => {
                if !addr::is_ipv4_global_unicast(server)
                    || !addr::is_ipv4_global_unicast(server2)
                {
                    warn!("server has a non-global IPv4 address; it will most likely not work");
                }
                QualState {
                    state: ProbeState::ProbingCone,
                    cone: true,
                    nonce: rand::random(),
                    addr: TeredoAddr::unset(server, true),
                    mtu: packet::TUNNEL_MTU as u16,
                    symmetric: false,
                }
            }
        };
        Arc::new(Self {
            mode,
            ignore_cone,
            params,
            out,
            peers: AsyncMutex::new(PeerDirectory::new()),
            qual: Mutex::new(qual),
            ra_received: Notify::new(),
            sink,
            icmp,
            state_cb,
        })
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn params(&self) -> QualificationParams {
        self.params
    }

    pub(crate) fn state_handler(&self) -> Arc<dyn StateHandler> {
        self.state_cb.clone()
    }

    pub(crate) fn qual(&self) -> MutexGuard<'_, QualState> {
        self.qual.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_client(&self) -> bool {
        matches!(self.mode, Mode::Client { .. })
    }

    fn is_relay(&self) -> bool {
        matches!(self.mode, Mode::Relay { .. })
    }

    /// Qualified (client) or statically configured (relay).
    pub fn is_running(&self) -> bool {
        self.qual().state == ProbeState::Qualified
    }

    /// Currently active Teredo address and MTU.
    #[must_use]
    pub fn current_address(&self) -> (Ipv6Addr, u16) {
        let q = self.qual();
        (q.addr.to_ipv6(), q.mtu)
    }

    fn prefix(&self) -> u32 {
        self.qual().addr.prefix
    }

    /// Best-effort datagram hand-off to the TX task.
    pub(crate) async fn send_udp(&self, to: SocketAddr, payload: Vec<u8>) {
        let _ = self.out.send((to, payload)).await;
    }

    fn is_server_packet(&self, src_ip: Ipv4Addr, src_port: u16) -> bool {
        // The source IP may legitimately be the secondary server address,
        // so both are accepted; the auth nonce does the real vetting.
        let Mode::Client { server, server2 } = self.mode else {
            return false;
        };
        src_port == TEREDO_PORT && (src_ip == server || src_ip == server2)
    }

    async fn send_unreachable(&self, code: u8, invoking: &[u8]) {
        let cone = self.qual().cone;
        let src = if cone { LINK_LOCAL_CONE } else { LINK_LOCAL_RESTRICT };
        if let Some(err) = packet::build_unreachable(code, &src, invoking) {
            let dst = read_ipv6(invoking, 8);
            self.icmp.send_error(&err, &dst).await;
        }
    }

    /// Send up to 3 connectivity pings toward `p`, reusing one nonce until
    /// it is acknowledged. Routed through the server like any packet to a
    /// not-yet-confirmed non-Teredo destination.
    async fn ping_peer(&self, our: TeredoAddr, p: &mut Peer) {
        let Mode::Client { server, .. } = self.mode else {
            return;
        };
        if !p.flags.nonce_pending {
            p.nonce = rand::random();
            p.flags.nonce_pending = true;
        }
        if p.flags.pings < 3 {
            p.flags.pings += 1;
            let ping = packet::build_ping(&our.to_ipv6(), &p.addr, &p.nonce);
            self.send_udp((server, TEREDO_PORT).into(), ping).await;
        }
    }

    /// Packet transmission: local IPv6 stack toward the tunnel.
    ///
    /// `Err` only reports peer-directory exhaustion; every malformed or
    /// unroutable packet is consumed silently (possibly answered with an
    /// ICMPv6 error through the sink).
    pub async fn transmit(&self, ip6: &[u8]) -> TeredoResult<()> {
        if ip6.len() < packet::IPV6_HEADER_LEN || ip6.len() > packet::MAX_IPV6_PACKET {
            return Ok(());
        }
        let plen = u16::from_be_bytes([ip6[4], ip6[5]]) as usize;
        if ip6[0] >> 4 != 6 || packet::IPV6_HEADER_LEN + plen != ip6.len() {
            return Ok(()); // not worth emitting, the far side would drop it
        }
        let src = read_ipv6(ip6, 8);
        let dst = read_ipv6(ip6, 24);

        let (our, running) = {
            let q = self.qual();
            (q.addr, q.state == ProbeState::Qualified)
        };
        if !running {
            self.send_unreachable(0, ip6).await;
            return Ok(());
        }
        if addr::prefix_of(&dst) != our.prefix && addr::prefix_of(&src) != our.prefix {
            // Routing unrelated traffic through the tunnel is forbidden;
            // the server would reject it anyway.
            self.send_unreachable(1, ip6).await;
            return Ok(());
        }

        let now = Instant::now();
        let mut peers = self.peers.lock().await;

        if let Some(p) = peers.find(&dst, now) {
            if p.flags.trusted {
                p.touch_transmit(now);
                let to = p.mapped();
                drop(peers);
                self.send_udp(to, ip6.to_vec()).await;
                return Ok(());
            }
        }

        if addr::prefix_of(&dst) != our.prefix {
            // Non-Teredo destination. A relay has no server to route
            // through; a client runs the direct connectivity test.
            if self.is_relay() {
                drop(peers);
                self.send_unreachable(1, ip6).await;
                return Ok(());
            }
            if peers.find(&dst, now).is_none() {
                let p = peers.allocate(dst, now)?;
                p.touch_transmit(now);
            }
            let Some(p) = peers.find(&dst, now) else {
                return Ok(());
            };
            p.outqueue.queue(ip6);
            self.ping_peer(our, p).await;
            return Ok(());
        }

        // Unknown or untrusted Teredo peer.
        let dst_server = addr::server_of(&dst);
        if !addr::is_ipv4_global_unicast(dst_server) {
            return Ok(()); // bogus embedded server address
        }
        if peers.find(&dst, now).is_none() {
            let (m_ip, m_port) = addr::mapping_of(&dst);
            let p = peers.allocate(dst, now)?;
            p.set_mapping(m_ip, m_port);
            p.touch_transmit(now);
            if addr::is_cone_flagged(&dst) && !self.ignore_cone {
                // Cone peers accept unsolicited traffic: no handshake.
                p.flags.trusted = true;
                let to = p.mapped();
                drop(peers);
                self.send_udp(to, ip6.to_vec()).await;
                return Ok(());
            }
        }
        let Some(p) = peers.find(&dst, now) else {
            return Ok(());
        };
        p.outqueue.queue(ip6);
        if p.flags.bubbles < 3 {
            p.flags.bubbles += 1;
            let bubble = packet::build_bubble(&our.to_ipv6(), &dst);
            if !our.is_cone() {
                // Open our own return path before the via-server bubble
                // asks the peer to answer.
                let to = p.mapped();
                self.send_udp(to, bubble.clone()).await;
            }
            self.send_udp((dst_server, TEREDO_PORT).into(), bubble).await;
        }
        Ok(())
    }

    /// Packet reception: one UDP datagram from the Teredo socket.
    pub async fn receive(
        &self,
        datagram: &[u8],
        src_ip: Ipv4Addr,
        src_port: u16,
    ) -> TeredoResult<()> {
        let Some(pkt) = packet::parse(datagram) else {
            return Ok(());
        };
        let ip6 = pkt.ipv6;
        if ip6.len() > packet::MAX_IPV6_PACKET {
            return Ok(());
        }
        let plen = u16::from_be_bytes([ip6[4], ip6[5]]) as usize;
        if ip6[0] >> 4 != 6 || packet::IPV6_HEADER_LEN + plen != ip6.len() {
            return Ok(());
        }
        let src6 = read_ipv6(ip6, 8);
        let dst6 = read_ipv6(ip6, 24);

        if self.is_client() {
            if !self.is_running() {
                return self.process_qualification_packet(&pkt, src_ip, src_port);
            }
            if self.is_server_packet(src_ip, src_port) {
                if let Some(done) = self.process_maintenance_packet(&pkt) {
                    return done;
                }
                if let Some(orig) = pkt.origin {
                    // NAT-opening signal relayed by the server: answer with
                    // a direct bubble to the disclosed endpoint.
                    let bubble = packet::build_bubble(&dst6, &src6);
                    self.send_udp(SocketAddrV4::new(orig.ip, orig.port).into(), bubble)
                        .await;
                    if packet::is_bubble(ip6) {
                        return Ok(());
                    }
                } else if packet::is_bubble(ip6) {
                    if addr::prefix_of(&src6) == self.prefix() {
                        // No origin indication, but the sender is a Teredo
                        // client so the mapping is embedded in its address.
                        let (ip, port) = addr::mapping_of(&src6);
                        let bubble = packet::build_bubble(&dst6, &src6);
                        self.send_udp(SocketAddrV4::new(ip, port).into(), bubble).await;
                    } else {
                        warn!("ignoring invalid bubble: the Teredo server is probably buggy");
                    }
                    return Ok(());
                }
                // Non-bubble traffic from the server is processed normally
                // below: the server may legitimately double as a relay.
            }
        }

        // Anti-spoof: link-local sources never reach the local stack. A
        // forged router advertisement would otherwise break IPv6 routing
        // outright (RFC 2461 requires link-local sources for RAs).
        if addr::is_link_local(&src6) {
            return Ok(());
        }

        let now = Instant::now();
        let mut peers = self.peers.lock().await;

        if let Some(p) = peers.find(&src6, now) {
            // Trusted peer whose observed origin matches the mapping.
            if p.flags.trusted && p.mapped_ip == src_ip && p.mapped_port == src_port {
                p.touch_receive(now);
                drop(peers);
                self.sink.deliver(ip6).await;
                return Ok(());
            }
            // Echo reply to an outstanding connectivity ping: adopt the
            // observed mapping and replay everything held back.
            if self.is_client()
                && !p.flags.trusted
                && p.flags.nonce_pending
                && packet::check_ping(ip6, &p.nonce)
            {
                p.flags.trusted = true;
                p.flags.nonce_pending = false;
                p.set_mapping(src_ip, src_port);
                p.touch_receive(now);
                let to = p.mapped();
                let outbound = p.outqueue.flush();
                let inbound = p.inqueue.flush();
                drop(peers);
                for held in outbound {
                    self.send_udp(to, held).await;
                }
                for held in inbound {
                    self.sink.deliver(&held).await;
                }
                self.sink.deliver(ip6).await;
                return Ok(());
            }
        }

        // Trusted mapping mismatch, unlisted peer, or untrusted client.
        if addr::prefix_of(&src6) == self.prefix() {
            if !addr::matches_client(&src6, src_ip, src_port) {
                return Ok(()); // spoofed mapping
            }
            if peers.find(&src6, now).is_none() {
                if self.is_relay() {
                    // Relays must not accept packets from unknown clients;
                    // the right relay for them is somewhere else.
                    return Ok(());
                }
                let (m_ip, m_port) = addr::mapping_of(&src6);
                let p = peers.allocate(src6, now)?;
                p.set_mapping(m_ip, m_port);
            } else if let Some(p) = peers.find(&src6, now) {
                let to = p.mapped();
                for held in p.outqueue.flush() {
                    self.send_udp(to, held).await;
                }
            }
            let Some(p) = peers.find(&src6, now) else {
                return Ok(());
            };
            p.flags.trusted = true;
            p.touch_receive(now);
            drop(peers);
            if packet::is_bubble(ip6) {
                return Ok(()); // bubbles are swallowed, never delivered
            }
            self.sink.deliver(ip6).await;
            return Ok(());
        }

        if self.is_relay() {
            return Ok(());
        }

        // Client: unknown non-Teredo source. Hold the packet and confirm
        // direct connectivity before handing anything to the stack.
        let our = self.qual().addr;
        if peers.find(&src6, now).is_none() {
            peers.allocate(src6, now)?;
        }
        let Some(p) = peers.find(&src6, now) else {
            return Ok(());
        };
        p.inqueue.queue(ip6);
        p.touch_receive(now);
        self.ping_peer(our, p).await;
        Ok(())
    }

    /// Steady-state counterpart of the qualification handler: a
    /// nonce-authenticated advertisement may move our address or MTU.
    /// Returns `Some` when the datagram was consumed.
    fn process_maintenance_packet(&self, pkt: &packet::TeredoPacket<'_>) -> Option<TeredoResult<()>> {
        let auth = pkt.auth?;
        enum Outcome {
            Mismatch,
            Updated(Option<(Ipv6Addr, u16)>),
            NotAnAdvert,
        }
        let outcome = {
            let mut q = self.qual();
            if auth.nonce != q.nonce {
                Outcome::Mismatch
            } else if let (Some(ra), Some(orig)) =
                (packet::parse_router_advertisement(pkt, q.cone), pkt.origin)
            {
                let new_addr = TeredoAddr {
                    prefix: ra.prefix,
                    server: ra.server,
                    flags: if q.cone { TEREDO_FLAG_CONE } else { 0 },
                    client_port: orig.port,
                    client_ip: orig.ip,
                };
                let new_mtu = ra.mtu.unwrap_or(q.mtu);
                let changed = new_addr != q.addr || new_mtu != q.mtu;
                q.addr = new_addr;
                q.mtu = new_mtu;
                // State is published before anyone is woken or notified.
                self.ra_received.notify_one();
                Outcome::Updated(changed.then_some((new_addr.to_ipv6(), new_mtu)))
            } else {
                Outcome::NotAnAdvert
            }
        };
        match outcome {
            Outcome::Mismatch => Some(Ok(())), // server authentication failure
            Outcome::Updated(Some((a, m))) => {
                info!(addr = %a, mtu = m, "Teredo address/MTU changed");
                self.state_cb.on_up(a, m);
                Some(Ok(()))
            }
            Outcome::Updated(None) => Some(Ok(())),
            Outcome::NotAnAdvert => None,
        }
    }

    /// Router-advertisement handling while not yet qualified.
    fn process_qualification_packet(
        &self,
        pkt: &packet::TeredoPacket<'_>,
        src_ip: Ipv4Addr,
        src_port: u16,
    ) -> TeredoResult<()> {
        if !self.is_server_packet(src_ip, src_port) {
            return Ok(());
        }
        // Advertisements without a nonce are trivially spoofable.
        let Some(auth) = pkt.auth else {
            return Ok(());
        };
        let refused = {
            let mut q = self.qual();
            if auth.nonce != q.nonce {
                return Ok(());
            }
            if auth.confirmation != 0 {
                true
            } else {
                let Some(orig) = pkt.origin else {
                    return Ok(());
                };
                let Some(ra) = packet::parse_router_advertisement(pkt, q.cone) else {
                    return Ok(());
                };
                let new_addr = TeredoAddr {
                    prefix: ra.prefix,
                    server: ra.server,
                    flags: if q.cone { TEREDO_FLAG_CONE } else { 0 },
                    client_port: orig.port,
                    client_ip: orig.ip,
                };
                if q.state == ProbeState::ProbingSymmetric {
                    // Two probes against distinct destinations must learn
                    // the same mapping, or the NAT is symmetric.
                    q.symmetric = q.addr.client_port != new_addr.client_port
                        || q.addr.client_ip != new_addr.client_ip;
                }
                if let Some(m) = ra.mtu {
                    q.mtu = m;
                }
                q.addr = new_addr;
                self.ra_received.notify_one();
                false
            }
        };
        if refused {
            tracing::error!("authentication refused by the Teredo server");
        }
        Ok(())
    }

    /// Bulk release of the peer directory (shutdown).
    pub async fn clear_peers(&self) {
        self.peers.lock().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}
