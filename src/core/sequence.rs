//! Wrap-aware sequence number arithmetic.
//!
//! Sequence counters are fixed-width and wrap around. Two counters are
//! compared through their signed distance modulo the counter space: `a` is
//! newer than `b` iff `a` is ahead of `b` by less than half the space.
//!
//! The free functions work on any width up to 31 bits; [`Seq`] is the
//! 16-bit counter carried on the wire.

use std::fmt;

/// Width of wire sequence numbers in bits.
pub const SEQUENCE_BITS: u32 = 16;

/// Signed distance from `b` to `a` in a `bits`-wide counter space.
///
/// The result lies in `(-2^(bits-1), 2^(bits-1)]`: a value exactly half the
/// space away is reported as ahead.
pub fn wrapping_distance(a: u32, b: u32, bits: u32) -> i32 {
    debug_assert!((1..=31).contains(&bits));
    let space = 1u32 << bits;
    let half = space >> 1;
    let mask = space - 1;

    let forward = a.wrapping_sub(b) & mask;
    if forward <= half {
        forward as i32
    } else {
        forward as i32 - space as i32
    }
}

/// `true` iff `a` is strictly ahead of `b`.
pub fn is_newer(a: u32, b: u32, bits: u32) -> bool {
    wrapping_distance(a, b, bits) > 0
}

/// `true` iff `seq` lies in `[base, base + size)` modulo the counter space.
pub fn within_window(seq: u32, base: u32, size: u32, bits: u32) -> bool {
    let distance = wrapping_distance(seq, base, bits);
    distance >= 0 && (distance as u32) < size
}

/// A 16-bit wire sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(u16);

impl Seq {
    /// The first sequence number of every pipeline.
    pub const ZERO: Seq = Seq(0);

    /// Wrap a raw wire value.
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw wire value.
    pub const fn get(self) -> u16 {
        self.0
    }

    /// The following sequence number (wrapping).
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// This sequence advanced by `n` steps (wrapping).
    pub const fn add(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Signed number of steps `self` is ahead of `other`.
    pub fn distance(self, other: Seq) -> i32 {
        wrapping_distance(self.0 as u32, other.0 as u32, SEQUENCE_BITS)
    }

    /// `true` iff `self` is strictly ahead of `other`.
    pub fn is_newer_than(self, other: Seq) -> bool {
        self.distance(other) > 0
    }

    /// `true` iff `self` lies in `[base, base + size)`.
    pub fn within_window(self, base: Seq, size: u16) -> bool {
        within_window(self.0 as u32, base.0 as u32, size as u32, SEQUENCE_BITS)
    }

    /// Ring-buffer slot for a window of `size` entries.
    pub fn slot(self, size: u16) -> usize {
        (self.0 % size) as usize
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Seq {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}
