#![forbid(unsafe_code)]

//! Teredo UDP envelope codec (RFC 4380 §5.1).
//!
//! A datagram is `[auth sub-header?][origin indication?][IPv6 packet]`.
//! Every length field is validated against the remaining buffer before use;
//! the input is attacker-controlled and truncation must never panic or
//! mis-frame. Parsing failures yield `None`, never an error value: the
//! pipeline drops malformed datagrams silently.

use std::net::{Ipv4Addr, Ipv6Addr};

use teredo_core::addr::{LINK_LOCAL_CONE, LINK_LOCAL_RESTRICT};

/// Type byte of the authentication sub-header.
const AUTH_HDR: u8 = 0x01;
/// Type byte of the origin indication.
const ORIGIN_IND: u8 = 0x00;

const IPPROTO_ICMPV6: u8 = 58;
/// "No next header"; bubbles carry this with a zero payload length.
const IPPROTO_NONE: u8 = 59;

const ICMP6_DST_UNREACH: u8 = 1;
const ICMP6_ECHO_REQUEST: u8 = 128;
const ICMP6_ECHO_REPLY: u8 = 129;
const ICMP6_ROUTER_SOLICIT: u8 = 133;
const ICMP6_ROUTER_ADVERT: u8 = 134;

const ND_OPT_PREFIX_INFORMATION: u8 = 3;
const ND_OPT_MTU: u8 = 5;

/// Minimum IPv6 header size; anything shorter is not a packet.
pub const IPV6_HEADER_LEN: usize = 40;
/// Largest IPv6 packet that fits a UDP payload.
pub const MAX_IPV6_PACKET: usize = 65507;
/// Tunnel MTU budget; ICMPv6 errors are truncated to fit it.
pub const TUNNEL_MTU: usize = 1280;

const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Parsed authentication sub-header. The identifier/auth-value fields are
/// skipped (unauthenticated qualification); only the nonce and the server's
/// confirmation byte matter to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHeader {
    pub nonce: [u8; 8],
    pub confirmation: u8,
}

/// Parsed origin indication, de-obfuscated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginIndication {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// One decoded Teredo datagram, borrowing the inner IPv6 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeredoPacket<'a> {
    pub auth: Option<AuthHeader>,
    pub origin: Option<OriginIndication>,
    pub ipv6: &'a [u8],
}

/// Prefix/MTU information extracted from a server router advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterAdvert {
    pub prefix: u32,
    pub server: Ipv4Addr,
    pub mtu: Option<u16>,
}

/// Decode a raw UDP payload. Returns `None` on any truncation or overrun,
/// or when fewer than 40 bytes remain for the inner packet.
pub fn parse(buf: &[u8]) -> Option<TeredoPacket<'_>> {
    let mut rest = buf;
    let mut auth = None;
    let mut origin = None;

    if rest.len() >= 2 && rest[0] == 0 && rest[1] == AUTH_HDR {
        let id_len = *rest.get(2)? as usize;
        let au_len = *rest.get(3)? as usize;
        // tag(2) id-len(1) auth-len(1) id au nonce(8) confirmation(1)
        let total = 4 + id_len + au_len + 9;
        if rest.len() < total {
            return None;
        }
        let off = 4 + id_len + au_len;
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&rest[off..off + 8]);
        auth = Some(AuthHeader { nonce, confirmation: rest[off + 8] });
        rest = &rest[total..];
    }

    if rest.len() >= 2 && rest[0] == 0 && rest[1] == ORIGIN_IND {
        if rest.len() < 8 {
            return None;
        }
        let port = !u16::from_be_bytes([rest[2], rest[3]]);
        let ip = Ipv4Addr::new(!rest[4], !rest[5], !rest[6], !rest[7]);
        origin = Some(OriginIndication { ip, port });
        rest = &rest[8..];
    }

    if rest.len() < IPV6_HEADER_LEN {
        return None;
    }
    Some(TeredoPacket { auth, origin, ipv6: rest })
}

/// ICMPv6 checksum over the IPv6 pseudo-header (RFC 4443 §2.3).
fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, payload: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in src.octets().chunks(2).chain(dst.octets().chunks(2)) {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    let len = payload.len() as u32;
    sum += len >> 16;
    sum += len & 0xffff;
    sum += u32::from(IPPROTO_ICMPV6);

    let mut iter = payload.chunks_exact(2);
    for chunk in &mut iter {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = iter.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn push_ipv6_header(buf: &mut Vec<u8>, src: &Ipv6Addr, dst: &Ipv6Addr, plen: u16, nxt: u8, hlim: u8) {
    buf.extend_from_slice(&0x6000_0000u32.to_be_bytes());
    buf.extend_from_slice(&plen.to_be_bytes());
    buf.push(nxt);
    buf.push(hlim);
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
}

fn finish_icmpv6(packet: &mut [u8], src: &Ipv6Addr, dst: &Ipv6Addr) {
    let ck = icmpv6_checksum(src, dst, &packet[IPV6_HEADER_LEN..]);
    packet[IPV6_HEADER_LEN + 2..IPV6_HEADER_LEN + 4].copy_from_slice(&ck.to_be_bytes());
}

/// Router solicitation with a leading authentication sub-header carrying
/// `nonce`. The link-local source encodes the current cone assumption so
/// that the server advertises the matching flags back.
pub fn build_router_solicitation(nonce: &[u8; 8], cone: bool) -> Vec<u8> {
    let src = if cone { LINK_LOCAL_CONE } else { LINK_LOCAL_RESTRICT };
    let mut buf = Vec::with_capacity(13 + IPV6_HEADER_LEN + 8);
    // Auth sub-header with empty client identifier and authentication value.
    buf.extend_from_slice(&[0, AUTH_HDR, 0, 0]);
    buf.extend_from_slice(nonce);
    buf.push(0); // confirmation

    let icmp_start = buf.len();
    push_ipv6_header(&mut buf, &src, &ALL_ROUTERS, 8, IPPROTO_ICMPV6, 255);
    buf.extend_from_slice(&[ICMP6_ROUTER_SOLICIT, 0, 0, 0, 0, 0, 0, 0]);
    finish_icmpv6(&mut buf[icmp_start..], &src, &ALL_ROUTERS);
    buf
}

/// Bubble: a bare IPv6 header with zero payload length and "no next
/// header", used purely to open and maintain NAT pinholes.
pub fn build_bubble(src: &Ipv6Addr, dst: &Ipv6Addr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(IPV6_HEADER_LEN);
    push_ipv6_header(&mut buf, src, dst, 0, IPPROTO_NONE, 255);
    buf
}

/// Whether an IPv6 packet is a bubble.
pub fn is_bubble(packet: &[u8]) -> bool {
    packet.len() >= IPV6_HEADER_LEN
        && packet[4] == 0
        && packet[5] == 0
        && packet[6] == IPPROTO_NONE
}

/// Direct-connectivity probe: ICMPv6 echo request carrying the peer nonce
/// as payload, correlated later by [`check_ping`].
pub fn build_ping(src: &Ipv6Addr, dst: &Ipv6Addr, nonce: &[u8; 8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(IPV6_HEADER_LEN + 16);
    push_ipv6_header(&mut buf, src, dst, 16, IPPROTO_ICMPV6, 64);
    buf.extend_from_slice(&[ICMP6_ECHO_REQUEST, 0, 0, 0, 0, 0, 0, 0]);
    buf.extend_from_slice(nonce);
    finish_icmpv6(&mut buf, src, dst);
    buf
}

/// Validate an inbound IPv6 packet as the echo reply to an outstanding
/// ping nonce.
pub fn check_ping(packet: &[u8], nonce: &[u8; 8]) -> bool {
    packet.len() >= IPV6_HEADER_LEN + 16
        && packet[6] == IPPROTO_ICMPV6
        && packet[IPV6_HEADER_LEN] == ICMP6_ECHO_REPLY
        && packet[IPV6_HEADER_LEN + 1] == 0
        && &packet[IPV6_HEADER_LEN + 8..IPV6_HEADER_LEN + 16] == nonce
}

/// ICMPv6 destination-unreachable wrapping the offending packet, truncated
/// so the whole error fits the 1280-byte tunnel MTU. Returns a complete
/// IPv6 packet addressed back to the offender's source.
pub fn build_unreachable(code: u8, src: &Ipv6Addr, invoking: &[u8]) -> Option<Vec<u8>> {
    if invoking.len() < IPV6_HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&invoking[8..24]);
    let dst = Ipv6Addr::from(dst);

    let copied = invoking.len().min(TUNNEL_MTU - IPV6_HEADER_LEN - 8);
    let plen = (8 + copied) as u16;
    let mut buf = Vec::with_capacity(IPV6_HEADER_LEN + 8 + copied);
    push_ipv6_header(&mut buf, src, &dst, plen, IPPROTO_ICMPV6, 255);
    buf.extend_from_slice(&[ICMP6_DST_UNREACH, code, 0, 0, 0, 0, 0, 0]);
    buf.extend_from_slice(&invoking[..copied]);
    finish_icmpv6(&mut buf, src, &dst);
    Some(buf)
}

/// Parse a server router advertisement received during qualification or
/// steady-state maintenance. `cone` selects which link-local source we
/// solicited from; the advertisement must be addressed back to it.
///
/// The client NAT mapping travels in the datagram's origin indication, not
/// in the advertisement body, so the packet-level headers are required.
pub fn parse_router_advertisement(packet: &TeredoPacket<'_>, cone: bool) -> Option<RouterAdvert> {
    packet.origin?;
    let ip6 = packet.ipv6;
    // RA body is 16 bytes past the IPv6 header.
    if ip6.len() < IPV6_HEADER_LEN + 16 {
        return None;
    }
    if ip6[0] >> 4 != 6 || ip6[6] != IPPROTO_ICMPV6 || ip6[7] != 255 {
        return None;
    }
    let expected_dst = if cone { LINK_LOCAL_CONE } else { LINK_LOCAL_RESTRICT };
    if ip6[24..40] != expected_dst.octets() {
        return None;
    }
    if ip6[IPV6_HEADER_LEN] != ICMP6_ROUTER_ADVERT || ip6[IPV6_HEADER_LEN + 1] != 0 {
        return None;
    }

    let mut prefix = None;
    let mut mtu = None;
    let mut off = IPV6_HEADER_LEN + 16;
    while off + 2 <= ip6.len() {
        let opt_type = ip6[off];
        let opt_len = ip6[off + 1] as usize * 8;
        if opt_len == 0 || off + opt_len > ip6.len() {
            return None; // malformed option
        }
        match opt_type {
            ND_OPT_PREFIX_INFORMATION if opt_len == 32 => {
                // Valid Teredo prefixes are always /64: prefix + server v4.
                if ip6[off + 2] == 64 {
                    let p = &ip6[off + 16..off + 24];
                    prefix = Some((
                        u32::from_be_bytes([p[0], p[1], p[2], p[3]]),
                        Ipv4Addr::new(p[4], p[5], p[6], p[7]),
                    ));
                }
            }
            ND_OPT_MTU if opt_len == 8 => {
                let m = u32::from_be_bytes([
                    ip6[off + 4],
                    ip6[off + 5],
                    ip6[off + 6],
                    ip6[off + 7],
                ]);
                if (TUNNEL_MTU as u32..=u32::from(u16::MAX)).contains(&m) {
                    mtu = Some(m as u16);
                }
            }
            _ => {}
        }
        off += opt_len;
    }

    let (prefix, server) = prefix?;
    Some(RouterAdvert { prefix, server, mtu })
}

/// Test helpers shared with the pipeline and qualification tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build the server datagram a qualification probe expects back:
    /// auth header + origin indication + RA with prefix info and MTU.
    pub(crate) fn build_ra_datagram(
        nonce: &[u8; 8],
        confirmation: u8,
        cone: bool,
        prefix: u32,
        server: Ipv4Addr,
        mapped: (Ipv4Addr, u16),
        mtu: Option<u32>,
    ) -> Vec<u8> {
        let mut buf = vec![0, AUTH_HDR, 0, 0];
        buf.extend_from_slice(nonce);
        buf.push(confirmation);

        buf.extend_from_slice(&[0, ORIGIN_IND]);
        buf.extend_from_slice(&(!mapped.1).to_be_bytes());
        let mo = mapped.0.octets();
        buf.extend_from_slice(&[!mo[0], !mo[1], !mo[2], !mo[3]]);

        let dst = if cone { LINK_LOCAL_CONE } else { LINK_LOCAL_RESTRICT };
        let src = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        let opt_len = 32 + if mtu.is_some() { 8 } else { 0 };
        let icmp_start = buf.len();
        push_ipv6_header(&mut buf, &src, &dst, (16 + opt_len) as u16, IPPROTO_ICMPV6, 255);
        buf.extend_from_slice(&[ICMP6_ROUTER_ADVERT, 0, 0, 0]);
        buf.extend_from_slice(&[0u8; 12]); // hop limit/flags/lifetimes
        if let Some(m) = mtu {
            buf.extend_from_slice(&[ND_OPT_MTU, 1, 0, 0]);
            buf.extend_from_slice(&m.to_be_bytes());
        }
        buf.extend_from_slice(&[ND_OPT_PREFIX_INFORMATION, 4, 64, 0]);
        buf.extend_from_slice(&[0u8; 12]); // lifetimes + reserved
        buf.extend_from_slice(&prefix.to_be_bytes());
        buf.extend_from_slice(&server.octets());
        buf.extend_from_slice(&[0u8; 8]);
        finish_icmpv6(&mut buf[icmp_start..], &src, &dst);
        buf
    }

    /// A minimal non-bubble IPv6 packet (8-byte dummy payload) between two
    /// addresses, with a consistent payload-length field.
    pub(crate) fn build_plain_ipv6(src: &Ipv6Addr, dst: &Ipv6Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IPV6_HEADER_LEN + 8);
        push_ipv6_header(&mut buf, src, dst, 8, IPPROTO_NONE, 64);
        buf.extend_from_slice(&[0xa5; 8]);
        buf
    }
}
