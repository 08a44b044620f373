//! Channel identifiers and delivery modes.
//!
//! A single byte selects the channel. Ids `0..=13` are reserved for the
//! library; the remaining 50 ids map to delivery modes as follows:
//!
//! | Id      | Mode                         |
//! |---------|------------------------------|
//! | 14      | unreliable                   |
//! | 15-30   | sequenced, slots 1-16        |
//! | 31      | reliable unordered           |
//! | 32-47   | reliable sequenced, slots 1-16 |
//! | 48-63   | reliable ordered, slots 1-16 |

use std::fmt;

use crate::core::SendError;
use crate::core::constants::{
    CHANNEL_COUNT, CHANNEL_RELIABLE_ORDERED_BASE, CHANNEL_RELIABLE_SEQUENCED_BASE,
    CHANNEL_RELIABLE_UNORDERED, CHANNEL_SEQUENCED_BASE, CHANNEL_UNRELIABLE, RESERVED_CHANNEL_MAX,
    SLOTS_PER_MODE,
};

/// Delivery guarantee of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Fire and forget, delivered as received.
    Unreliable,
    /// Not retransmitted; stale arrivals are dropped.
    Sequenced,
    /// Retransmitted until acked; delivered once, in any order.
    ReliableUnordered,
    /// Retransmitted until acked; stale arrivals are acked but not delivered.
    ReliableSequenced,
    /// Retransmitted until acked; delivered in send order without gaps.
    ReliableOrdered,
}

impl DeliveryMode {
    /// Whether the mode retains copies and expects acknowledgments.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMode::ReliableUnordered
                | DeliveryMode::ReliableSequenced
                | DeliveryMode::ReliableOrdered
        )
    }
}

/// An application channel id (`14..=63`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

impl ChannelId {
    /// The unreliable channel.
    pub const UNRELIABLE: ChannelId = ChannelId(CHANNEL_UNRELIABLE);

    /// The reliable-unordered channel.
    pub const RELIABLE_UNORDERED: ChannelId = ChannelId(CHANNEL_RELIABLE_UNORDERED);

    /// Validate a raw id.
    pub fn new(raw: u8) -> Result<Self, SendError> {
        if raw <= RESERVED_CHANNEL_MAX || raw as usize >= CHANNEL_COUNT {
            return Err(SendError::InvalidChannel(raw));
        }
        Ok(Self(raw))
    }

    /// Sequenced channel for `slot` (1-16).
    pub fn sequenced(slot: u8) -> Option<Self> {
        Self::slotted(CHANNEL_SEQUENCED_BASE, slot)
    }

    /// Reliable-sequenced channel for `slot` (1-16).
    pub fn reliable_sequenced(slot: u8) -> Option<Self> {
        Self::slotted(CHANNEL_RELIABLE_SEQUENCED_BASE, slot)
    }

    /// Reliable-ordered channel for `slot` (1-16).
    pub fn reliable_ordered(slot: u8) -> Option<Self> {
        Self::slotted(CHANNEL_RELIABLE_ORDERED_BASE, slot)
    }

    fn slotted(base: u8, slot: u8) -> Option<Self> {
        (1..=SLOTS_PER_MODE)
            .contains(&slot)
            .then(|| Self(base + slot - 1))
    }

    /// The raw wire byte.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Index into a per-connection channel table.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Delivery mode selected by this id.
    pub fn mode(self) -> DeliveryMode {
        match self.0 {
            CHANNEL_UNRELIABLE => DeliveryMode::Unreliable,
            id if id < CHANNEL_RELIABLE_UNORDERED => DeliveryMode::Sequenced,
            CHANNEL_RELIABLE_UNORDERED => DeliveryMode::ReliableUnordered,
            id if id < CHANNEL_RELIABLE_ORDERED_BASE => DeliveryMode::ReliableSequenced,
            _ => DeliveryMode::ReliableOrdered,
        }
    }

    /// Slot within the mode (1-16), or 1 for single-channel modes.
    pub fn slot(self) -> u8 {
        match self.mode() {
            DeliveryMode::Unreliable | DeliveryMode::ReliableUnordered => 1,
            DeliveryMode::Sequenced => self.0 - CHANNEL_SEQUENCED_BASE + 1,
            DeliveryMode::ReliableSequenced => self.0 - CHANNEL_RELIABLE_SEQUENCED_BASE + 1,
            DeliveryMode::ReliableOrdered => self.0 - CHANNEL_RELIABLE_ORDERED_BASE + 1,
        }
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = SendError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
