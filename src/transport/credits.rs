//! Per-channel send credits shared with application threads.
//!
//! Application threads reserve a credit before queueing a reliable message;
//! the heartbeat returns it once the message is acknowledged, fails, or is
//! abandoned. This lets `send` reject synchronously without touching
//! connection state.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::channel::ChannelId;
use crate::core::constants::CHANNEL_COUNT;

/// In-flight counters for every channel of one connection.
#[derive(Debug)]
pub struct ChannelCredits {
    limit: usize,
    in_flight: [AtomicUsize; CHANNEL_COUNT],
}

impl ChannelCredits {
    /// Create counters allowing `limit` in-flight messages per channel.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Reserve one credit; `false` when the channel is at its limit.
    ///
    /// Channels without retransmission never run out.
    pub fn try_acquire(&self, channel: ChannelId) -> bool {
        if !channel.mode().is_reliable() {
            return true;
        }
        self.in_flight[channel.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Return `count` credits.
    pub fn release(&self, channel: ChannelId, count: usize) {
        if !channel.mode().is_reliable() || count == 0 {
            return;
        }
        let result = self.in_flight[channel.index()].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| Some(n.saturating_sub(count)),
        );
        if let Ok(previous) = result
            && previous < count
        {
            warn!(channel = %channel, previous, count, "released more credits than reserved");
        }
    }

    /// Messages currently counted against `channel`.
    pub fn in_flight(&self, channel: ChannelId) -> usize {
        self.in_flight[channel.index()].load(Ordering::Acquire)
    }

    /// The per-channel limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}
