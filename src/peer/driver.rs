//! tokio driver: runs a [`Peer`]'s heartbeat against a UDP socket.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, info};

use crate::core::NetError;
use crate::transport::UdpTransport;

use super::config::PeerConfig;
use super::handle::{PeerEvents, PeerHandle};
use super::peer::Peer;

/// A running driver task.
#[derive(Debug)]
pub struct Driver {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Driver {
    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the driver to stop (after [`PeerHandle::shutdown`]).
    pub async fn join(self) {
        if let Err(error) = self.task.await {
            debug!(error = %error, "driver task ended abnormally");
        }
    }

    /// Stop the driver without sending disconnect notices.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Bind `addr` and drive a new peer on the current tokio runtime.
pub async fn bind(
    config: PeerConfig,
    addr: SocketAddr,
) -> Result<(PeerHandle, PeerEvents, Driver), NetError> {
    let (peer, handle, events) = Peer::new(config)?;
    let transport = UdpTransport::bind(addr).await?;
    let driver = spawn(peer, transport)?;
    Ok((handle, events, driver))
}

/// Drive `peer` over `transport` on a spawned task.
pub fn spawn(peer: Peer, transport: UdpTransport) -> Result<Driver, NetError> {
    let local_addr = transport.local_addr()?;
    let task = tokio::spawn(run(peer, transport));
    Ok(Driver { local_addr, task })
}

/// Tick `peer` until shutdown completes.
///
/// Ticks on the heartbeat interval and whenever the socket turns readable.
pub async fn run(mut peer: Peer, mut transport: UdpTransport) {
    let mut ticks = time::interval(peer.config().heartbeat_interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let socket = transport.clone();
    info!(addr = ?socket.local_addr().ok(), "peer running");

    loop {
        select! {
            _ = ticks.tick() => {}
            readable = socket.inner().readable() => {
                if let Err(error) = readable {
                    debug!(error = %error, "readiness check failed");
                }
            }
        }
        peer.heartbeat(Instant::now(), &mut transport);
        if peer.is_stopped() {
            info!("peer stopped");
            break;
        }
    }
}
