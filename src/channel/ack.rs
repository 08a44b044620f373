//! Selective acknowledgment records.
//!
//! The receiver side of every reliable channel keeps an [`AckWindow`]: the
//! oldest sequence not yet received (`base`) plus a bitfield over the next
//! `size` sequences. It answers "have I seen this before?" for duplicate
//! suppression and periodically emits an [`AckRecord`] so the sender can
//! retire what arrived.

use std::time::Instant;

use crate::core::Seq;

use super::id::ChannelId;

/// Wire acknowledgment for one reliable channel.
///
/// Every sequence before `base` has been received. Bit `i` of `bits`
/// (LSB first) marks receipt of `base + i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    /// Channel the record acknowledges.
    pub channel: ChannelId,
    /// Oldest sequence not cumulatively confirmed.
    pub base: Seq,
    /// Selective receipt bits following `base`.
    pub bits: Vec<u8>,
}

impl AckRecord {
    /// Whether the record confirms receipt of `seq`.
    pub fn acknowledges(&self, seq: Seq) -> bool {
        let distance = seq.distance(self.base);
        if distance < 0 {
            return true;
        }
        let offset = distance as usize;
        self.bits
            .get(offset / 8)
            .is_some_and(|byte| byte & (1 << (offset % 8)) != 0)
    }

    /// Number of sequences covered by the bitfield.
    pub fn span(&self) -> usize {
        self.bits.len() * 8
    }
}

/// How an inbound sequence relates to the receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Never seen and inside the window.
    Fresh,
    /// Never seen, a full window or more ahead of `base`.
    BeyondWindow,
    /// Already received (behind `base` or already marked).
    Duplicate,
}

/// Receiver-side record of which sequences arrived.
#[derive(Debug, Clone)]
pub struct AckWindow {
    base: Seq,
    size: u16,
    /// Ring bitfield indexed by `seq.slot(size)`.
    received: Vec<u64>,
    pending_since: Option<Instant>,
}

impl AckWindow {
    /// Create an empty window expecting `Seq::ZERO` first.
    pub fn new(size: u16) -> Self {
        Self {
            base: Seq::ZERO,
            size,
            received: vec![0; (size as usize).div_ceil(64)],
            pending_since: None,
        }
    }

    /// Oldest sequence not yet received.
    pub fn base(&self) -> Seq {
        self.base
    }

    /// Classify an inbound sequence without changing state.
    pub fn classify(&self, seq: Seq) -> Arrival {
        let distance = seq.distance(self.base);
        if distance < 0 {
            Arrival::Duplicate
        } else if distance >= self.size as i32 {
            Arrival::BeyondWindow
        } else if self.is_marked(seq) {
            Arrival::Duplicate
        } else {
            Arrival::Fresh
        }
    }

    /// Mark `seq` as received and advance `base` over the contiguous prefix.
    ///
    /// A sequence beyond the window first slides the window so `seq` is its
    /// last entry; the skipped sequences are given up on. Returns the
    /// number of sequences skipped that way.
    pub fn record(&mut self, seq: Seq) -> u16 {
        let mut skipped = 0;
        let distance = seq.distance(self.base);
        if distance < 0 {
            return 0;
        }
        if distance >= self.size as i32 {
            let new_base = seq.add(1).add(self.size.wrapping_neg());
            while self.base != new_base {
                if !self.is_marked(self.base) {
                    skipped += 1;
                }
                self.clear(self.base);
                self.base = self.base.next();
            }
        }

        self.mark(seq);
        while self.is_marked(self.base) {
            self.clear(self.base);
            self.base = self.base.next();
        }
        skipped
    }

    /// Remember that an ack must go out.
    pub fn note_pending(&mut self, now: Instant) {
        self.pending_since.get_or_insert(now);
    }

    /// When the oldest unsent acknowledgment became due, if any.
    pub fn pending_since(&self) -> Option<Instant> {
        self.pending_since
    }

    /// Build the current record and clear the pending flag.
    pub fn take_record(&mut self, channel: ChannelId) -> AckRecord {
        self.pending_since = None;

        let mut bits = vec![0u8; (self.size as usize).div_ceil(8)];
        for offset in 0..self.size {
            if self.is_marked(self.base.add(offset)) {
                bits[offset as usize / 8] |= 1 << (offset % 8);
            }
        }
        AckRecord {
            channel,
            base: self.base,
            bits,
        }
    }

    fn is_marked(&self, seq: Seq) -> bool {
        let slot = seq.slot(self.size);
        self.received[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn mark(&mut self, seq: Seq) {
        let slot = seq.slot(self.size);
        self.received[slot / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, seq: Seq) {
        let slot = seq.slot(self.size);
        self.received[slot / 64] &= !(1 << (slot % 64));
    }
}
