//! Receive-side reorder buffer for reliable-ordered channels.

use bytes::Bytes;

use crate::core::Seq;

/// Holds messages that arrived ahead of the next expected sequence.
///
/// Delivery is strictly in sequence order with no gaps. At most `size`
/// messages are buffered; the slot of a buffered message is
/// `seq.slot(size)`.
#[derive(Debug)]
pub struct ReorderBuffer {
    expected: Seq,
    size: u16,
    slots: Vec<Option<Bytes>>,
    buffered: usize,
}

impl ReorderBuffer {
    /// Create an empty buffer expecting `Seq::ZERO`.
    pub fn new(size: u16) -> Self {
        Self {
            expected: Seq::ZERO,
            size,
            slots: (0..size).map(|_| None).collect(),
            buffered: 0,
        }
    }

    /// Next sequence to be delivered.
    pub fn expected(&self) -> Seq {
        self.expected
    }

    /// Number of messages held back.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Whether `seq` is already buffered.
    pub fn contains(&self, seq: Seq) -> bool {
        seq.within_window(self.expected, self.size) && self.slots[seq.slot(self.size)].is_some()
    }

    /// Accept a message and append everything now deliverable to `out`.
    ///
    /// Returns `false` (and changes nothing) for a sequence behind
    /// `expected` or already buffered. A sequence a full window or more
    /// ahead moves `expected` forward first, delivering whatever was
    /// buffered in between and skipping the gaps.
    pub fn insert(&mut self, seq: Seq, payload: Bytes, out: &mut Vec<Bytes>) -> bool {
        let distance = seq.distance(self.expected);
        if distance < 0 || self.contains(seq) {
            return false;
        }

        if distance >= self.size as i32 {
            let new_expected = seq.add(1).add(self.size.wrapping_neg());
            while self.expected != new_expected {
                if let Some(buffered) = self.slots[self.expected.slot(self.size)].take() {
                    self.buffered -= 1;
                    out.push(buffered);
                }
                self.expected = self.expected.next();
            }
            self.drain(out);
        }

        if seq == self.expected {
            out.push(payload);
            self.expected = self.expected.next();
            self.drain(out);
        } else {
            self.slots[seq.slot(self.size)] = Some(payload);
            self.buffered += 1;
        }
        true
    }

    fn drain(&mut self, out: &mut Vec<Bytes>) {
        while let Some(next) = self.slots[self.expected.slot(self.size)].take() {
            self.buffered -= 1;
            out.push(next);
            self.expected = self.expected.next();
        }
    }
}
