//! Channel layer: delivery modes and their per-channel state machines.
//!
//! Everything here is pure state, driven by explicit `Instant`s and free of
//! sockets, so it can be exercised deterministically.

mod ack;
mod fragment;
mod id;
mod pipeline;
mod reorder;
mod resend;

pub use ack::{AckRecord, AckWindow, Arrival};
pub use fragment::{Fragment, FragmentError, Reassembler, Reassembly, split};
pub use id::{ChannelId, DeliveryMode};
pub use pipeline::{ChannelPipeline, ReceiveOutcome, TransmitReport};
pub use reorder::ReorderBuffer;
pub use resend::{Acked, Failed, OutgoingMessage, ResendPolicy, SendWindow};
