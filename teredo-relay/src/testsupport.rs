//! Capture-everything doubles for pipeline and qualification tests.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use teredo_core::addr::TeredoAddr;

use crate::maintenance::{ProbeState, QualificationParams};
use crate::relay::{IcmpSink, Ipv6Sink, Mode, StateHandler, TeredoTunnel};

pub(crate) const SERVER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);
pub(crate) const SERVER2: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 2);

#[derive(Default)]
pub(crate) struct CaptureSink {
    pub delivered: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Ipv6Sink for CaptureSink {
    async fn deliver(&self, packet: &[u8]) {
        self.delivered.lock().unwrap().push(packet.to_vec());
    }
}

impl CaptureSink {
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.delivered.lock().unwrap())
    }
}

#[derive(Default)]
pub(crate) struct CaptureIcmp {
    pub errors: Mutex<Vec<(Vec<u8>, Ipv6Addr)>>,
}

#[async_trait]
impl IcmpSink for CaptureIcmp {
    async fn send_error(&self, packet: &[u8], dst: &Ipv6Addr) {
        self.errors.lock().unwrap().push((packet.to_vec(), *dst));
    }
}

#[derive(Default)]
pub(crate) struct CaptureEvents {
    pub ups: Mutex<Vec<(Ipv6Addr, u16)>>,
    pub downs: AtomicU32,
}

impl StateHandler for CaptureEvents {
    fn on_up(&self, addr: Ipv6Addr, mtu: u16) {
        self.ups.lock().unwrap().push((addr, mtu));
    }

    fn on_down(&self) {
        self.downs.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureEvents {
    pub fn down_count(&self) -> u32 {
        self.downs.load(Ordering::SeqCst)
    }
}

pub(crate) struct Harness {
    pub tunnel: Arc<TeredoTunnel>,
    pub rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    pub sink: Arc<CaptureSink>,
    pub icmp: Arc<CaptureIcmp>,
    pub events: Arc<CaptureEvents>,
}

fn build(mode: Mode, cone: bool, ignore_cone: bool, params: QualificationParams) -> Harness {
    let (tx, rx) = mpsc::channel(64);
    let sink = Arc::new(CaptureSink::default());
    let icmp = Arc::new(CaptureIcmp::default());
    let events = Arc::new(CaptureEvents::default());
    let tunnel = TeredoTunnel::new(
        mode,
        cone,
        ignore_cone,
        params,
        tx,
        sink.clone(),
        icmp.clone(),
        events.clone(),
    );
    Harness { tunnel, rx, sink, icmp, events }
}

pub(crate) fn client(ignore_cone: bool, params: QualificationParams) -> Harness {
    build(
        Mode::Client { server: SERVER, server2: SERVER2 },
        true,
        ignore_cone,
        params,
    )
}

pub(crate) fn relay(prefix: u32, cone: bool, ignore_cone: bool) -> Harness {
    build(Mode::Relay { prefix }, cone, ignore_cone, QualificationParams::default())
}

/// Skip qualification: install `our` as the active address.
pub(crate) fn force_qualified(tunnel: &TeredoTunnel, our: TeredoAddr) {
    let mut q = tunnel.qual();
    q.state = ProbeState::Qualified;
    q.cone = our.is_cone();
    q.addr = our;
}

/// Everything currently sitting in the outbound UDP channel.
pub(crate) fn drain(rx: &mut mpsc::Receiver<(SocketAddr, Vec<u8>)>) -> Vec<(SocketAddr, Vec<u8>)> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
