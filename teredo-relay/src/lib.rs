#![forbid(unsafe_code)]

//! Teredo tunneling engine (RFC 4380): IPv6 connectivity for hosts behind
//! IPv4 NATs, carried over UDP port 3544.
//!
//! * [`TeredoService`] binds the UDP socket and runs the RX/TX tasks.
//! * [`relay::TeredoTunnel`] holds the per-packet pipeline and peer state.
//! * [`maintenance`] qualifies client endpoints and keeps mappings alive.
//!
//! The service deals in whole packets: IPv6 packets from the local stack go
//! in through [`TeredoService::transmit`], decapsulated ones come out through
//! the caller-provided [`Ipv6Sink`]. Attaching those packets to an actual
//! tunnel interface is the caller's problem.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use socket2::{Domain, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use teredo_core::addr;

pub mod maintenance;
pub mod packet;
pub mod peer;
pub mod queue;
pub mod relay;

#[cfg(test)]
pub(crate) mod testsupport;

pub use maintenance::{ProbeState, QualificationParams, SERVER_PING_DELAY};
pub use relay::{IcmpSink, Ipv6Sink, Mode, StateHandler, TeredoTunnel};
pub use teredo_core::{RelayType, TeredoConfig, TeredoError, TeredoResult};

/// Receive buffer size; envelope headers plus the largest IPv6 packet.
const RECV_BUFFER: usize = 65535;

/// Depth of the channel between the pipeline and the socket writer.
const TX_QUEUE: usize = 1024;

/// UDP socket wrapper: wraps a single socket but keeps Arc for sharing.
#[derive(Clone)]
pub struct UdpPool {
    socket: Arc<UdpSocket>,
}

impl UdpPool {
    /// Bind with `SO_REUSEADDR` so a restarting daemon reclaims its port.
    /// Must be called inside a Tokio runtime.
    pub fn bind(bind: Ipv4Addr, port: u16) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(bind), port);
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let std_sock: std::net::UdpSocket = socket.into();
        std_sock.set_nonblocking(true)?;
        let udp = UdpSocket::from_std(std_sock)?;
        Ok(Self { socket: Arc::new(udp) })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

/// Running tunnel endpoint. Owns the socket tasks and, in client mode, the
/// qualification task; dropping the service does not stop them, call
/// [`TeredoService::shutdown`].
pub struct TeredoService {
    tunnel: Arc<TeredoTunnel>,
    pool: UdpPool,
    shutdown: watch::Sender<bool>,
}

impl TeredoService {
    /// Validate `cfg`, bind the socket and spawn the RX/TX/maintenance
    /// tasks. Returns once the endpoint is operational (a client may still
    /// be qualifying; watch [`StateHandler::on_up`]).
    pub async fn start(
        cfg: &TeredoConfig,
        sink: Arc<dyn Ipv6Sink>,
        icmp: Arc<dyn IcmpSink>,
        state: Arc<dyn StateHandler>,
    ) -> anyhow::Result<Self> {
        cfg.validate().context("invalid tunnel configuration")?;

        let (mode, cone) = match cfg.relay_type {
            RelayType::Client => {
                let server = cfg
                    .server_address
                    .context("client mode requires server_address")?;
                let server2 = cfg.server_address2.unwrap_or(server);
                (Mode::Client { server, server2 }, true)
            }
            RelayType::Cone | RelayType::Restricted => {
                let prefix = cfg.prefix.context("relay mode requires prefix")?;
                (
                    Mode::Relay { prefix: addr::prefix_of(&prefix) },
                    cfg.relay_type == RelayType::Cone,
                )
            }
        };
        let params = QualificationParams {
            timeout: cfg.qualification_timeout(),
            retries: cfg.qualification_retries,
            restart_delay: cfg.restart_delay(),
        };

        let pool = UdpPool::bind(cfg.bind_address, cfg.bind_port)
            .context("binding the Teredo UDP socket")?;
        let sock = pool.socket();
        let (tx, mut rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(TX_QUEUE);
        let tunnel = TeredoTunnel::new(
            mode,
            cone,
            cfg.ignore_cone_bit,
            params,
            tx,
            sink,
            icmp,
            state,
        );
        let (shutdown, shutdown_rx) = watch::channel(false);

        // TX task: drains the pipeline's outbound channel. Closes when the
        // tunnel (every channel sender) is dropped.
        let tx_sock = sock.clone();
        tokio::spawn(async move {
            while let Some((to, data)) = rx.recv().await {
                if let Err(e) = tx_sock.send_to(&data, to).await {
                    error!(%to, "udp send error: {e}");
                }
            }
        });

        // RX task: every datagram goes through packet reception. Non-IPv4
        // sources cannot be Teredo peers and are dropped outright.
        let rx_sock = sock.clone();
        let rx_tunnel = tunnel.clone();
        let mut rx_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                let (len, from) = tokio::select! {
                    _ = rx_shutdown.changed() => return,
                    r = rx_sock.recv_from(&mut buf) => match r {
                        Ok(x) => x,
                        Err(e) => {
                            error!("udp recv error: {e}");
                            continue;
                        }
                    },
                };
                let IpAddr::V4(src_ip) = from.ip() else {
                    continue;
                };
                if let Err(e) = rx_tunnel.receive(&buf[..len], src_ip, from.port()).await {
                    debug!("datagram dropped: {e}");
                }
            }
        });

        if matches!(mode, Mode::Client { .. }) {
            tokio::spawn(maintenance::run(tunnel.clone(), shutdown_rx));
        }

        let local = sock.local_addr().context("reading the bound socket address")?;
        info!(addr = %local, mode = ?cfg.relay_type, "teredo endpoint started");
        Ok(Self { tunnel, pool, shutdown })
    }

    /// Hand one IPv6 packet from the local stack to the tunnel.
    pub async fn transmit(&self, packet: &[u8]) -> TeredoResult<()> {
        self.tunnel.transmit(packet).await
    }

    /// Whether the endpoint currently holds a usable Teredo address.
    pub fn is_running(&self) -> bool {
        self.tunnel.is_running()
    }

    /// Currently active Teredo address and MTU.
    pub fn current_address(&self) -> (std::net::Ipv6Addr, u16) {
        self.tunnel.current_address()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.pool.socket().local_addr()
    }

    /// Stop the background tasks and drop all peer state.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.tunnel.clear_peers().await;
    }
}
