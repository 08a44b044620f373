//! Message fragmentation and reassembly.
//!
//! A message too large for one unit is split into fixed-size fragments that
//! all carry the message's sequence number as their group id. The receiver
//! collects fragments per `(channel, group)` and releases the message only
//! once every index `0..count` is present. Incomplete groups expire after
//! a timeout; an expired group leaves a tombstone for one more timeout so
//! stragglers are dropped instead of opening a fresh, never-completing group.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::Seq;

use super::id::ChannelId;

/// Fragment validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Index not below the declared count.
    #[error("fragment index {index} out of range for count {count}")]
    IndexOutOfRange {
        /// Received index.
        index: u16,
        /// Declared count.
        count: u16,
    },

    /// Declared count differs from the group's count.
    #[error("fragment count {actual} does not match group count {expected}")]
    CountMismatch {
        /// Count of the existing group.
        expected: u16,
        /// Count carried by this fragment.
        actual: u16,
    },

    /// A fragment must declare at least one piece.
    #[error("fragment count is zero")]
    ZeroCount,

    /// Declared count exceeds what the largest allowed message needs.
    #[error("fragment count {count} exceeds limit {max}")]
    TooManyFragments {
        /// Declared count.
        count: u16,
        /// Largest count accepted.
        max: u16,
    },
}

/// One piece of a fragmented message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Channel of the owning message.
    pub channel: ChannelId,
    /// Sequence number of the owning message.
    pub group: Seq,
    /// Position within the group.
    pub index: u16,
    /// Number of fragments in the group.
    pub count: u16,
    /// Slice of the message payload.
    pub payload: Bytes,
}

/// Split `payload` into fragments of at most `fragment_size` bytes.
///
/// The last fragment may be shorter. Slicing a [`Bytes`] is zero-copy.
pub fn split(channel: ChannelId, group: Seq, payload: &Bytes, fragment_size: usize) -> Vec<Fragment> {
    debug_assert!(fragment_size > 0);
    let count = payload.len().div_ceil(fragment_size).max(1);
    debug_assert!(count <= u16::MAX as usize);

    (0..count)
        .map(|index| {
            let start = index * fragment_size;
            let end = (start + fragment_size).min(payload.len());
            Fragment {
                channel,
                group,
                index: index as u16,
                count: count as u16,
                payload: payload.slice(start..end),
            }
        })
        .collect()
}

/// Partially received message.
#[derive(Debug)]
struct ReassemblyGroup {
    count: u16,
    received: u16,
    pieces: Vec<Option<Bytes>>,
    started: Instant,
}

impl ReassemblyGroup {
    fn new(count: u16, now: Instant) -> Self {
        Self {
            count,
            received: 0,
            pieces: vec![None; count as usize],
            started: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.count
    }

    fn assemble(self) -> Bytes {
        let total: usize = self.pieces.iter().flatten().map(Bytes::len).sum();
        let mut buffer = BytesMut::with_capacity(total);
        for piece in self.pieces.into_iter().flatten() {
            buffer.extend_from_slice(&piece);
        }
        buffer.freeze()
    }
}

/// Outcome of offering a fragment to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// The group is complete; here is the full message.
    Complete(Bytes),
    /// Stored; more fragments are needed.
    Pending,
    /// Already had this index.
    Duplicate,
    /// Group expired recently; fragment discarded.
    Expired,
}

/// Per-connection reassembly table.
#[derive(Debug)]
pub struct Reassembler {
    groups: FxHashMap<(ChannelId, Seq), ReassemblyGroup>,
    tombstones: FxHashMap<(ChannelId, Seq), Instant>,
    timeout: Duration,
    max_groups: usize,
    max_count: u16,
}

impl Reassembler {
    /// Create a reassembler with the given group timeout, group limit and
    /// largest fragment count per group.
    pub fn new(timeout: Duration, max_groups: usize, max_count: u16) -> Self {
        Self {
            groups: FxHashMap::default(),
            tombstones: FxHashMap::default(),
            timeout,
            max_groups,
            max_count,
        }
    }

    /// Number of incomplete groups held.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Offer a fragment.
    ///
    /// Malformed fragments return an error and leave every group untouched.
    pub fn insert(&mut self, fragment: Fragment, now: Instant) -> Result<Reassembly, FragmentError> {
        if fragment.count == 0 {
            return Err(FragmentError::ZeroCount);
        }
        if fragment.count > self.max_count {
            return Err(FragmentError::TooManyFragments {
                count: fragment.count,
                max: self.max_count,
            });
        }
        if fragment.index >= fragment.count {
            return Err(FragmentError::IndexOutOfRange {
                index: fragment.index,
                count: fragment.count,
            });
        }
        if fragment.count == 1 {
            return Ok(Reassembly::Complete(fragment.payload));
        }

        let key = (fragment.channel, fragment.group);
        if self.tombstones.contains_key(&key) {
            trace!(channel = %fragment.channel, group = %fragment.group, "fragment for expired group dropped");
            return Ok(Reassembly::Expired);
        }

        if let Some(group) = self.groups.get(&key)
            && group.count != fragment.count
        {
            return Err(FragmentError::CountMismatch {
                expected: group.count,
                actual: fragment.count,
            });
        }

        if !self.groups.contains_key(&key) && self.groups.len() >= self.max_groups {
            self.evict_oldest();
        }

        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| ReassemblyGroup::new(fragment.count, now));
        let piece = &mut group.pieces[fragment.index as usize];
        if piece.is_some() {
            return Ok(Reassembly::Duplicate);
        }
        *piece = Some(fragment.payload);
        group.received += 1;

        if !group.is_complete() {
            return Ok(Reassembly::Pending);
        }
        match self.groups.remove(&key) {
            Some(group) => Ok(Reassembly::Complete(group.assemble())),
            None => Ok(Reassembly::Pending),
        }
    }

    /// Drop groups older than the timeout and forget old tombstones.
    ///
    /// Returns how many groups were purged.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        self.tombstones
            .retain(|_, expired_at| now.saturating_duration_since(*expired_at) < timeout);

        let expired: Vec<_> = self
            .groups
            .iter()
            .filter(|(_, group)| now.saturating_duration_since(group.started) >= timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            debug!(channel = %key.0, group = %key.1, "reassembly group expired");
            self.groups.remove(key);
            self.tombstones.insert(*key, now);
        }
        expired.len()
    }

    /// Discard everything (teardown or reset).
    pub fn clear(&mut self) {
        self.groups.clear();
        self.tombstones.clear();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.started)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            debug!(channel = %key.0, group = %key.1, "reassembly table full; evicting oldest group");
            self.groups.remove(&key);
        }
    }
}
