//! Peer layer: the connection-owning engine and its application surface.
//!
//! - [`Peer`]: owns every connection of one socket; all state changes happen
//!   in [`Peer::heartbeat`]
//! - [`PeerHandle`] / [`PeerEvents`]: thread-safe command and event queues
//! - [`driver`]: runs the heartbeat on a tokio interval over UDP
//!
//! # Example
//!
//! ```no_run
//! use netchannel::prelude::*;
//!
//! # async fn demo() -> Result<(), NetError> {
//! let (handle, mut events, _driver) =
//!     driver::bind(PeerConfig::default(), "0.0.0.0:0".parse().unwrap()).await?;
//!
//! let server = "127.0.0.1:14242".parse().unwrap();
//! handle.connect(server, "hello")?;
//! handle.send(server, ChannelId::reliable_ordered(1).unwrap(), "queued until connected")?;
//!
//! while let Some(event) = events.recv().await {
//!     if let PeerEvent::Data { payload, .. } = event {
//!         println!("{payload:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
pub mod driver;
mod event;
mod handle;
#[allow(clippy::module_inception)]
mod peer;

pub use config::{PeerConfig, PeerConfigBuilder};
pub use event::PeerEvent;
pub use handle::{PeerEvents, PeerHandle};
pub use peer::Peer;
