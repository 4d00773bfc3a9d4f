//! End-to-end exercise of a relay endpoint over loopback sockets.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use teredo_core::addr::TeredoAddr;
use teredo_relay::{
    IcmpSink, Ipv6Sink, RelayType, StateHandler, TeredoConfig, TeredoService,
};

struct ChannelSink(mpsc::Sender<Vec<u8>>);

#[async_trait]
impl Ipv6Sink for ChannelSink {
    async fn deliver(&self, packet: &[u8]) {
        let _ = self.0.send(packet.to_vec()).await;
    }
}

struct NullIcmp;

#[async_trait]
impl IcmpSink for NullIcmp {
    async fn send_error(&self, _packet: &[u8], _dst: &Ipv6Addr) {}
}

struct NullState;

impl StateHandler for NullState {
    fn on_up(&self, _addr: Ipv6Addr, _mtu: u16) {}
    fn on_down(&self) {}
}

/// Minimal IPv6 packet (no next header, 8 payload bytes).
fn plain_ipv6(src: &Ipv6Addr, dst: &Ipv6Addr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(48);
    buf.extend_from_slice(&0x6000_0000u32.to_be_bytes());
    buf.extend_from_slice(&8u16.to_be_bytes());
    buf.push(59); // no next header
    buf.push(64);
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(&[0x5a; 8]);
    buf
}

#[tokio::test]
async fn relay_forwards_cone_clients_both_ways() {
    let (tx, mut delivered) = mpsc::channel(4);
    let cfg = TeredoConfig {
        relay_type: RelayType::Cone,
        prefix: Some("2001::".parse().unwrap()),
        bind_address: Ipv4Addr::LOCALHOST,
        bind_port: 0,
        ignore_cone_bit: false,
        ..Default::default()
    };
    let svc = TeredoService::start(
        &cfg,
        Arc::new(ChannelSink(tx)),
        Arc::new(NullIcmp),
        Arc::new(NullState),
    )
    .await
    .expect("service starts");
    assert!(svc.is_running(), "relays are statically qualified");
    let relay_addr = svc.local_addr().unwrap();

    // A cone Teredo client whose NAT mapping points at our test socket.
    let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    let client = TeredoAddr::new(
        Ipv4Addr::new(198, 51, 100, 9),
        Ipv4Addr::LOCALHOST,
        peer_port,
        true,
    );
    let native: Ipv6Addr = "2001:db8::1".parse().unwrap();

    // Native host -> cone client: forwarded directly, no handshake.
    let out = plain_ipv6(&native, &client.to_ipv6());
    svc.transmit(&out).await.unwrap();
    let mut buf = [0u8; 1500];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
        .await
        .expect("forwarded in time")
        .unwrap();
    assert_eq!(&buf[..n], &out[..]);
    assert_eq!(from, relay_addr);

    // Return direction: the now-known client answers through the relay.
    let back = plain_ipv6(&client.to_ipv6(), &native);
    peer.send_to(&back, relay_addr).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
        .await
        .expect("delivered in time")
        .unwrap();
    assert_eq!(got, back);

    svc.shutdown().await;
}
