//! Transport layer: wire units, connections, and the socket seam.
//!
//! This module turns channel state into datagrams and back:
//!
//! - **Wire codec**: [`Unit`], [`UnitReader`] and [`DatagramPacker`]
//! - **Connection state machine**: [`Connection`] with handshake, heartbeat and teardown
//! - **RTT estimation**: [`RttEstimator`] (RFC 6298) fed by acks and [`PingTracker`]
//! - **Backpressure**: [`ChannelCredits`] shared with application handles
//! - **Buffers**: [`BufferPool`] for outbound datagrams
//! - **Sockets**: [`DatagramSocket`] seam and the tokio-backed [`UdpTransport`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Peer                       │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   units, connections, RTT, credits      │
//! ├─────────────────────────────────────────┤
//! │         Channel Layer                   │
//! │   acks, resends, reorder, fragments     │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod credits;
mod error;
mod frame;
mod pool;
mod socket;
mod timing;

pub use connection::*;
pub use credits::ChannelCredits;
pub use error::*;
pub use frame::*;
pub use pool::BufferPool;
pub use socket::*;
pub use timing::{PingTracker, RttEstimator, constants as timing_constants};
