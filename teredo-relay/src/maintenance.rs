#![forbid(unsafe_code)]

//! Client qualification and steady-state maintenance (RFC 4380 §5.2.1).
//!
//! Runs as its own task, independently of packet processing. It sends
//! router solicitations and waits for the reception path to apply a
//! nonce-matched advertisement to the shared state and signal
//! [`crate::relay::TeredoTunnel::ra_received`]; the update always happens
//! under the state lock before the signal, so a woken probe observes the
//! advertised address. The task holds the lock only around transitions,
//! never across a wait, and every sleep is interruptible by shutdown.

use std::time::Duration;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use teredo_core::addr::{TeredoAddr, TEREDO_PORT};

use crate::packet;
use crate::relay::{Mode, TeredoTunnel};

/// Interval between mapping-refresh solicitations while qualified.
pub const SERVER_PING_DELAY: Duration = Duration::from_secs(30);

/// NAT probe progress. `Qualified` is the terminal (steady) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    ProbingCone,
    ProbingRestricted,
    ProbingSymmetric,
    Qualified,
}

/// Timing knobs of the qualification procedure.
#[derive(Debug, Clone, Copy)]
pub struct QualificationParams {
    /// Wait for a router advertisement per solicitation.
    pub timeout: Duration,
    /// Consecutive timeouts tolerated before falling back a stage.
    pub retries: u32,
    /// Cool-down after connectivity loss or symmetric NAT detection.
    pub restart_delay: Duration,
}

impl Default for QualificationParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4),
            retries: 3,
            restart_delay: Duration::from_secs(300),
        }
    }
}

/// State shared between this task and the packet pipeline, guarded by one
/// mutex in [`TeredoTunnel`].
#[derive(Debug)]
pub(crate) struct QualState {
    pub state: ProbeState,
    /// Current cone-NAT assumption; selects the solicitation source and
    /// the flags of the learned address.
    pub cone: bool,
    /// Session nonce echoed by the server's authentication header.
    pub nonce: [u8; 8],
    /// Currently active Teredo address (prefix unset until qualified).
    pub addr: TeredoAddr,
    pub mtu: u16,
    /// Set by the reception path when the symmetric probe learned a
    /// different mapping than the restricted probe.
    pub symmetric: bool,
}

/// Outcome of a probe transition that requires work outside the lock.
enum After {
    None,
    Up(std::net::Ipv6Addr, u16),
    SymmetricFailure,
}

/// Sleep that loses against shutdown. Returns `true` on shutdown.
async fn sleep_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = shutdown.changed() => true,
    }
}

/// Qualification/maintenance loop. Terminates on shutdown.
pub(crate) async fn run(tunnel: Arc<TeredoTunnel>, mut shutdown: watch::Receiver<bool>) {
    let Mode::Client { server, server2 } = tunnel.mode() else {
        return; // relays are statically qualified
    };
    let params = tunnel.params();
    let mut count: u32 = 0;

    loop {
        {
            let state = tunnel.qual().state;
            if state == ProbeState::Qualified && count == 0 {
                // Steady state: refresh the mapping every 30 s.
                if sleep_or_shutdown(SERVER_PING_DELAY, &mut shutdown).await {
                    return;
                }
            }
        }

        let (probe_server, nonce, cone) = {
            let q = tunnel.qual();
            // The restricted probe goes to the secondary address; the
            // symmetric probe returns to the primary so the two learned
            // mappings come from distinct destinations.
            let s = if q.state == ProbeState::ProbingRestricted {
                server2
            } else {
                server
            };
            (s, q.nonce, q.cone)
        };

        let rs = packet::build_router_solicitation(&nonce, cone);
        // Register interest before sending so a fast answer cannot be lost.
        let advertised = tunnel.ra_received.notified();
        tunnel.send_udp((probe_server, TEREDO_PORT).into(), rs).await;

        let wait = tokio::select! {
            _ = shutdown.changed() => return,
            r = tokio::time::timeout(params.timeout, advertised) => r,
        };

        match wait {
            Err(_elapsed) => {
                let mut down = false;
                {
                    let mut q = tunnel.qual();
                    if q.state == ProbeState::ProbingSymmetric {
                        // Re-run the restricted probe; do not count this.
                        q.state = ProbeState::ProbingRestricted;
                    } else {
                        count += 1;
                        if count >= params.retries {
                            down = q.state == ProbeState::Qualified;
                            count = 0;
                            if q.state == ProbeState::ProbingCone {
                                q.state = ProbeState::ProbingRestricted;
                                q.cone = false;
                            } else {
                                q.state = ProbeState::ProbingCone;
                                q.cone = true;
                            }
                        }
                    }
                }
                if down {
                    warn!("lost Teredo connectivity");
                    tunnel.state_handler().on_down();
                    if sleep_or_shutdown(params.restart_delay, &mut shutdown).await {
                        return;
                    }
                }
            }
            Ok(()) => {
                let after = {
                    let mut q = tunnel.qual();
                    match q.state {
                        ProbeState::Qualified => After::None,
                        ProbeState::ProbingSymmetric if q.symmetric => {
                            count = 0;
                            q.symmetric = false;
                            q.state = ProbeState::ProbingCone;
                            After::SymmetricFailure
                        }
                        ProbeState::ProbingCone => {
                            q.state = ProbeState::ProbingRestricted;
                            After::None
                        }
                        ProbeState::ProbingRestricted => {
                            q.state = ProbeState::ProbingSymmetric;
                            After::None
                        }
                        ProbeState::ProbingSymmetric => {
                            count = 0;
                            q.state = ProbeState::Qualified;
                            After::Up(q.addr.to_ipv6(), q.mtu)
                        }
                    }
                };
                match after {
                    After::None => {}
                    After::Up(addr, mtu) => {
                        info!(
                            nat = if cone { "cone" } else { "restricted" },
                            %addr, mtu, "Teredo qualification succeeded"
                        );
                        tunnel.state_handler().on_up(addr, mtu);
                    }
                    After::SymmetricFailure => {
                        error!("unsupported symmetric NAT detected");
                        if sleep_or_shutdown(params.restart_delay, &mut shutdown).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}
