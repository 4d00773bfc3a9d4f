#![forbid(unsafe_code)]

//! Teredo IPv6 address layout (RFC 4380 §4):
//! `[ 32b prefix | 32b server_ipv4 | 16b flags | 16b ~port | 32b ~client_ipv4 ]`.
//!
//! Port and client IPv4 are stored ones-complemented ("obfuscated") on the
//! wire; this module packs/unpacks them so the rest of the code only ever
//! sees plain values.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Well-known Teredo UDP service port.
pub const TEREDO_PORT: u16 = 3544;

/// Global Teredo service prefix `2001:0000::/32`.
pub const TEREDO_PREFIX: u32 = 0x2001_0000;

/// Sentinel prefix of an unqualified client; never matches a valid prefix.
pub const PREFIX_UNSET: u32 = 0xffff_ffff;

/// Cone flag (C-bit) in the 16-bit flags field.
pub const TEREDO_FLAG_CONE: u16 = 0x8000;

/// Link-local source used in router solicitations and ICMPv6 errors when
/// assuming a cone NAT (flags field carries the C-bit).
pub const LINK_LOCAL_CONE: Ipv6Addr =
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0x8000, 0xffff, 0xffff, 0xfffe);

/// Link-local source when assuming a restricted NAT.
pub const LINK_LOCAL_RESTRICT: Ipv6Addr =
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0xffff, 0xffff, 0xfffe);

/// Decomposed Teredo address. Field values are plain (de-obfuscated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeredoAddr {
    pub prefix: u32,
    pub server: Ipv4Addr,
    pub flags: u16,
    pub client_port: u16,
    pub client_ip: Ipv4Addr,
}

impl TeredoAddr {
    /// Construct a complete Teredo address from a server IPv4 and the
    /// NAT-mapped client endpoint. `cone` asserts the C-bit.
    #[must_use]
    pub fn new(server: Ipv4Addr, client_ip: Ipv4Addr, client_port: u16, cone: bool) -> Self {
        Self {
            prefix: TEREDO_PREFIX,
            server,
            flags: if cone { TEREDO_FLAG_CONE } else { 0 },
            client_port,
            client_ip,
        }
    }

    /// Placeholder address of a not-yet-qualified client: prefix unset,
    /// server known, mapping unknown.
    #[must_use]
    pub fn unset(server: Ipv4Addr, cone: bool) -> Self {
        Self {
            prefix: PREFIX_UNSET,
            server,
            flags: if cone { TEREDO_FLAG_CONE } else { 0 },
            client_port: 0,
            client_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Decompose an IPv6 address. Meaningful only when `prefix` turns out
    /// to be a Teredo prefix; the caller checks that.
    #[must_use]
    pub fn from_ipv6(ip: &Ipv6Addr) -> Self {
        let o = ip.octets();
        Self {
            prefix: u32::from_be_bytes([o[0], o[1], o[2], o[3]]),
            server: Ipv4Addr::new(o[4], o[5], o[6], o[7]),
            flags: u16::from_be_bytes([o[8], o[9]]),
            client_port: !u16::from_be_bytes([o[10], o[11]]),
            client_ip: Ipv4Addr::new(!o[12], !o[13], !o[14], !o[15]),
        }
    }

    /// Pack back into an IPv6 address, obfuscating the client mapping.
    #[must_use]
    pub fn to_ipv6(&self) -> Ipv6Addr {
        let mut o = [0u8; 16];
        o[0..4].copy_from_slice(&self.prefix.to_be_bytes());
        o[4..8].copy_from_slice(&self.server.octets());
        o[8..10].copy_from_slice(&self.flags.to_be_bytes());
        o[10..12].copy_from_slice(&(!self.client_port).to_be_bytes());
        let c = self.client_ip.octets();
        o[12..16].copy_from_slice(&[!c[0], !c[1], !c[2], !c[3]]);
        Ipv6Addr::from(o)
    }

    #[must_use]
    pub fn is_cone(&self) -> bool {
        self.flags & TEREDO_FLAG_CONE != 0
    }
}

/// First 32 bits of an IPv6 address, compared against the Teredo prefix.
#[must_use]
pub fn prefix_of(ip: &Ipv6Addr) -> u32 {
    let o = ip.octets();
    u32::from_be_bytes([o[0], o[1], o[2], o[3]])
}

/// Server IPv4 embedded in a Teredo address.
#[must_use]
pub fn server_of(ip: &Ipv6Addr) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(o[4], o[5], o[6], o[7])
}

/// De-obfuscated NAT mapping (client IPv4, UDP port) embedded in a Teredo
/// address.
#[must_use]
pub fn mapping_of(ip: &Ipv6Addr) -> (Ipv4Addr, u16) {
    let a = TeredoAddr::from_ipv6(ip);
    (a.client_ip, a.client_port)
}

/// Whether the C-bit is set in a Teredo address.
#[must_use]
pub fn is_cone_flagged(ip: &Ipv6Addr) -> bool {
    ip.octets()[8] & 0x80 != 0
}

/// Spoof check: does the mapping embedded in `ip` equal the observed
/// datagram origin?
#[must_use]
pub fn matches_client(ip: &Ipv6Addr, observed_ip: Ipv4Addr, observed_port: u16) -> bool {
    let (m_ip, m_port) = mapping_of(ip);
    m_ip == observed_ip && m_port == observed_port
}

/// Link-local unicast test (fe80::/10). Packets with such a source must
/// never reach the local stack (RFC 2461 anti-spoof, see pipeline).
#[must_use]
pub fn is_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// Conservative global-unicast test for embedded server IPv4 addresses.
/// Rejects unspecified, loopback, RFC 1918, link-local, multicast and
/// class E space.
#[must_use]
pub fn is_ipv4_global_unicast(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    !(o[0] == 0
        || o[0] == 10
        || o[0] == 127
        || (o[0] == 169 && o[1] == 254)
        || (o[0] == 172 && o[1] & 0xf0 == 16)
        || (o[0] == 192 && o[1] == 168)
        || o[0] >= 224)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_encoding() {
        let server = Ipv4Addr::new(192, 0, 2, 1);
        let client = Ipv4Addr::new(203, 0, 113, 4);
        let port: u16 = 40000;
        let seg = TeredoAddr::new(server, client, port, false).to_ipv6().segments();

        // Service prefix 2001:0000::/32
        assert_eq!(seg[0], 0x2001);
        assert_eq!(seg[1], 0x0000);

        // Server IPv4 embedding
        assert_eq!(seg[2], 0xc000);
        assert_eq!(seg[3], 0x0201);

        // Flags zero, port and client IP ones-complemented
        assert_eq!(seg[4], 0x0000);
        assert_eq!(seg[5], !port);
        assert_eq!(seg[6], !0xcb00);
        assert_eq!(seg[7], !0x7104);
    }

    #[test]
    fn pack_unpack_round_trip() {
        let a = TeredoAddr::new(
            Ipv4Addr::new(198, 51, 100, 9),
            Ipv4Addr::new(203, 0, 113, 77),
            61234,
            true,
        );
        let ip = a.to_ipv6();
        assert!(is_cone_flagged(&ip));
        assert_eq!(TeredoAddr::from_ipv6(&ip), a);
        assert_eq!(prefix_of(&ip), TEREDO_PREFIX);
        assert_eq!(server_of(&ip), a.server);
        assert_eq!(mapping_of(&ip), (a.client_ip, a.client_port));
    }

    #[test]
    fn client_match_is_exact() {
        let ip = TeredoAddr::new(
            Ipv4Addr::new(198, 51, 100, 9),
            Ipv4Addr::new(203, 0, 113, 77),
            61234,
            false,
        )
        .to_ipv6();
        assert!(matches_client(&ip, Ipv4Addr::new(203, 0, 113, 77), 61234));
        assert!(!matches_client(&ip, Ipv4Addr::new(203, 0, 113, 77), 61235));
        assert!(!matches_client(&ip, Ipv4Addr::new(203, 0, 113, 78), 61234));
    }

    #[test]
    fn link_local_detection() {
        assert!(is_link_local(&LINK_LOCAL_CONE));
        assert!(is_link_local(&LINK_LOCAL_RESTRICT));
        assert!(!is_link_local(&"2001::1".parse().unwrap()));
    }

    #[test]
    fn global_unicast_v4() {
        assert!(is_ipv4_global_unicast(Ipv4Addr::new(198, 51, 100, 1)));
        for bad in [
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(169, 254, 0, 1),
            Ipv4Addr::new(172, 22, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(224, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 255),
        ] {
            assert!(!is_ipv4_global_unicast(bad), "{bad}");
        }
    }
}
