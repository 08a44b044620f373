//! # netchannel
//!
//! Peer-to-peer message transport over UDP with per-channel delivery
//! guarantees, built for real-time applications that need low latency with
//! selective reliability rather than one TCP-like stream.
//!
//! - **Channels**: 64 channel ids per connection, each fixed to one delivery
//!   mode (unreliable, sequenced, reliable unordered/sequenced/ordered)
//! - **Reliability**: selective acks, retransmission with doubling timeouts,
//!   reorder buffers, receipts
//! - **Fragmentation**: oversized messages split and reassembled transparently
//! - **Lifecycle**: three-way handshake, ping/pong RTT, link-loss detection,
//!   best-effort disconnect
//! - **Sans-IO core**: all state changes happen in one heartbeat tick driven
//!   by an explicit clock; a tokio driver is included
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and sequence arithmetic
//! - [`channel`]: channel ids and per-channel delivery pipelines
//! - [`transport`]: wire codec, connection state machine, socket seam
//! - [`peer`]: the heartbeat-owned engine, its handle and the tokio driver
//!
//! ## Example Usage
//!
//! ```rust
//! use std::time::Instant;
//! use netchannel::prelude::*;
//!
//! let (mut peer, handle, mut events) = Peer::new(PeerConfig::default()).unwrap();
//!
//! let remote = "127.0.0.1:14242".parse().unwrap();
//! handle.connect(remote, "hail").unwrap();
//! handle.send(remote, ChannelId::RELIABLE_UNORDERED, "hello").unwrap();
//!
//! struct Discard;
//! impl DatagramSocket for Discard {
//!     fn try_send(&mut self, _: std::net::SocketAddr, _: &[u8]) -> std::io::Result<()> {
//!         Ok(())
//!     }
//!     fn try_recv(&mut self, _: &mut [u8]) -> std::io::Result<Option<(usize, std::net::SocketAddr)>> {
//!         Ok(None)
//!     }
//! }
//!
//! peer.heartbeat(Instant::now(), &mut Discard);
//! assert_eq!(peer.status(remote), Some(ConnectionStatus::Connecting));
//! assert!(matches!(events.poll(), Some(PeerEvent::StatusChanged { .. })));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod channel;
pub mod core;
pub mod peer;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{ChannelId, DeliveryMode};
    pub use crate::core::{ConfigError, NetError, SendError, Seq};
    pub use crate::peer::{Peer, PeerConfig, PeerEvent, PeerEvents, PeerHandle, driver};
    pub use crate::transport::{
        ConnectionStats, ConnectionStatus, DatagramSocket, TransportError, UdpTransport,
    };
}

// Re-export commonly used items at crate root
pub use channel::{ChannelId, DeliveryMode};
pub use crate::core::{NetError, SendError};
pub use peer::{Peer, PeerConfig, PeerEvent, PeerHandle};
