//! Datagram socket seam.
//!
//! The engine never blocks on I/O: it drains inbound datagrams and hands
//! outbound ones over through [`DatagramSocket`], whose methods must return
//! immediately. [`UdpTransport`] implements it over a tokio UDP socket; tests
//! implement it over in-memory queues.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

/// Receive buffer size large enough for any UDP datagram.
pub const RECV_BUFFER_SIZE: usize = 65535;

/// Non-blocking datagram I/O used by the heartbeat.
pub trait DatagramSocket {
    /// Hand one datagram to the network. May fail transiently (e.g. `WouldBlock`).
    fn try_send(&mut self, target: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    /// Receive one datagram into `buf` if one is ready.
    ///
    /// Returns `Ok(None)` when nothing is pending.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Whether an I/O error means the remote port refused our traffic.
pub fn is_forcible_close(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

/// tokio UDP socket driven without awaiting.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a new socket to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    /// Wrap an existing tokio UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Underlying socket, for the driver's readiness wait.
    pub(crate) fn inner(&self) -> &UdpSocket {
        &self.socket
    }
}

impl DatagramSocket for UdpTransport {
    fn try_send(&mut self, target: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        self.socket.try_send_to(datagram, target).map(|_| ())
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
