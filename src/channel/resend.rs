//! Sender-side retention and retransmission for reliable channels.
//!
//! Each submitted message takes the next sequence number and is kept in a
//! ring of `window` slots until an [`AckRecord`] confirms it or it runs out
//! of resend attempts. A message whose slot is still occupied waits in the
//! unsent queue, so the outstanding sequences never span more than one ack
//! window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::core::Seq;

use super::ack::AckRecord;

/// A message waiting to be sent on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Application payload.
    pub payload: Bytes,
    /// Opaque tag reported back on acknowledgment or failure.
    pub receipt: Option<Bytes>,
}

impl OutgoingMessage {
    /// Message without a receipt.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            receipt: None,
        }
    }

    /// Message that reports a receipt.
    pub fn with_receipt(payload: impl Into<Bytes>, receipt: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            receipt: Some(receipt.into()),
        }
    }
}

/// Retransmission timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPolicy {
    /// Timeout before the first retransmission.
    pub initial_delay: Duration,
    /// Upper bound for the doubled timeout.
    pub max_delay: Duration,
    /// Retransmissions allowed before the message is declared failed.
    pub max_resends: u32,
}

/// An unacknowledged message.
#[derive(Debug, Clone)]
struct PendingSend {
    seq: Seq,
    message: OutgoingMessage,
    first_sent: Instant,
    last_sent: Instant,
    resends: u32,
    timeout: Duration,
}

/// A message retired by acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acked {
    /// Its sequence number.
    pub seq: Seq,
    /// Receipt tag, if one was requested.
    pub receipt: Option<Bytes>,
    /// Round-trip sample, only for messages never retransmitted.
    pub rtt_sample: Option<Duration>,
}

/// A message retired after exhausting its resends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    /// Its sequence number.
    pub seq: Seq,
    /// Receipt tag, if one was requested.
    pub receipt: Option<Bytes>,
}

/// Sender state of one reliable channel.
#[derive(Debug)]
pub struct SendWindow {
    next_seq: Seq,
    size: u16,
    slots: Vec<Option<PendingSend>>,
    outstanding: usize,
    unsent: VecDeque<OutgoingMessage>,
}

impl SendWindow {
    /// Create an empty window of `size` slots.
    pub fn new(size: u16) -> Self {
        Self {
            next_seq: Seq::ZERO,
            size,
            slots: (0..size).map(|_| None).collect(),
            outstanding: 0,
            unsent: VecDeque::new(),
        }
    }

    /// Queue a message for sending.
    pub fn queue(&mut self, message: OutgoingMessage) {
        self.unsent.push_back(message);
    }

    /// Messages queued or unacknowledged.
    pub fn in_flight(&self) -> usize {
        self.outstanding + self.unsent.len()
    }

    /// Messages sent and awaiting acknowledgment.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Sequence the next released message will take.
    pub fn next_seq(&self) -> Seq {
        self.next_seq
    }

    /// Move queued messages into the window while slots are free.
    ///
    /// Each released message is appended to `out` for its first transmission.
    pub fn release(&mut self, now: Instant, policy: &ResendPolicy, out: &mut Vec<(Seq, Bytes)>) {
        while !self.unsent.is_empty() {
            let slot = self.next_seq.slot(self.size);
            if self.slots[slot].is_some() {
                trace!(seq = %self.next_seq, "send window full; holding message");
                break;
            }
            let Some(message) = self.unsent.pop_front() else {
                break;
            };

            let seq = self.next_seq;
            out.push((seq, message.payload.clone()));
            self.slots[slot] = Some(PendingSend {
                seq,
                message,
                first_sent: now,
                last_sent: now,
                resends: 0,
                timeout: policy.initial_delay,
            });
            self.outstanding += 1;
            self.next_seq = seq.next();
        }
    }

    /// Retire every outstanding message the record acknowledges.
    pub fn on_ack(&mut self, record: &AckRecord, now: Instant) -> Vec<Acked> {
        let mut acked = Vec::new();
        for slot in self.slots.iter_mut() {
            let confirmed = slot
                .as_ref()
                .is_some_and(|pending| record.acknowledges(pending.seq));
            if !confirmed {
                continue;
            }
            if let Some(pending) = slot.take() {
                let rtt_sample =
                    (pending.resends == 0).then(|| now.saturating_duration_since(pending.first_sent));
                trace!(seq = %pending.seq, resends = pending.resends, "message acknowledged");
                acked.push(Acked {
                    seq: pending.seq,
                    receipt: pending.message.receipt,
                    rtt_sample,
                });
            }
        }
        self.outstanding -= acked.len();
        acked
    }

    /// Retransmit every message whose timeout elapsed.
    ///
    /// Retransmissions go to `out`; messages past `max_resends` are retired
    /// and returned as failures.
    pub fn poll_resends(
        &mut self,
        now: Instant,
        policy: &ResendPolicy,
        out: &mut Vec<(Seq, Bytes)>,
    ) -> Vec<Failed> {
        let mut failed = Vec::new();
        for slot in self.slots.iter_mut() {
            let Some(pending) = slot.as_mut() else {
                continue;
            };
            if now.saturating_duration_since(pending.last_sent) <= pending.timeout {
                continue;
            }

            if pending.resends >= policy.max_resends {
                debug!(seq = %pending.seq, resends = pending.resends, "giving up on message");
                if let Some(pending) = slot.take() {
                    failed.push(Failed {
                        seq: pending.seq,
                        receipt: pending.message.receipt,
                    });
                }
                continue;
            }

            pending.resends += 1;
            pending.last_sent = now;
            pending.timeout = (pending.timeout * 2).min(policy.max_delay);
            trace!(seq = %pending.seq, resends = pending.resends, timeout = ?pending.timeout, "resending");
            out.push((pending.seq, pending.message.payload.clone()));
        }
        self.outstanding -= failed.len();
        failed
    }

    /// Abandon everything; returns how many messages were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.in_flight();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.unsent.clear();
        self.outstanding = 0;
        self.next_seq = Seq::ZERO;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;

    fn policy() -> ResendPolicy {
        ResendPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_resends: 3,
        }
    }

    fn ack_all_before(base: u16) -> AckRecord {
        AckRecord {
            channel: ChannelId::RELIABLE_UNORDERED,
            base: Seq::new(base),
            bits: vec![0; 1],
        }
    }

    #[test]
    fn test_release_assigns_sequences() {
        let mut window = SendWindow::new(8);
        let now = Instant::now();
        window.queue(OutgoingMessage::new("a"));
        window.queue(OutgoingMessage::new("b"));

        let mut out = Vec::new();
        window.release(now, &policy(), &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (Seq::new(0), Bytes::from("a")));
        assert_eq!(out[1], (Seq::new(1), Bytes::from("b")));
        assert_eq!(window.outstanding(), 2);
        assert_eq!(window.next_seq(), Seq::new(2));
    }

    #[test]
    fn test_window_full_holds_messages() {
        let mut window = SendWindow::new(8);
        let now = Instant::now();
        for i in 0..10u8 {
            window.queue(OutgoingMessage::new(vec![i]));
        }

        let mut out = Vec::new();
        window.release(now, &policy(), &mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(window.in_flight(), 10);

        // acking seq 0 frees exactly one slot
        let record = AckRecord {
            channel: ChannelId::RELIABLE_UNORDERED,
            base: Seq::new(1),
            bits: vec![0; 1],
        };
        assert_eq!(window.on_ack(&record, now).len(), 1);

        out.clear();
        window.release(now, &policy(), &mut out);
        assert_eq!(out, vec![(Seq::new(8), Bytes::from(vec![8u8]))]);
    }

    #[test]
    fn test_selective_ack() {
        let mut window = SendWindow::new(8);
        let now = Instant::now();
        for _ in 0..4 {
            window.queue(OutgoingMessage::new("x"));
        }
        window.release(now, &policy(), &mut Vec::new());

        // base 0 missing; 1 and 3 received
        let record = AckRecord {
            channel: ChannelId::RELIABLE_UNORDERED,
            base: Seq::new(0),
            bits: vec![0b0000_1010],
        };
        let acked = window.on_ack(&record, now + Duration::from_millis(30));
        let seqs: Vec<_> = acked.iter().map(|a| a.seq.get()).collect();
        assert_eq!(seqs, vec![1, 3]);
        assert_eq!(acked[0].rtt_sample, Some(Duration::from_millis(30)));
        assert_eq!(window.outstanding(), 2);
    }

    #[test]
    fn test_resend_backoff_doubles() {
        let mut window = SendWindow::new(8);
        let start = Instant::now();
        window.queue(OutgoingMessage::new("x"));
        window.release(start, &policy(), &mut Vec::new());

        let mut out = Vec::new();
        // not yet due
        window.poll_resends(start + Duration::from_millis(100), &policy(), &mut out);
        assert!(out.is_empty());

        // first resend after 100ms, then 200ms, then 400ms
        let mut now = start;
        for interval in [101, 201, 401] {
            now += Duration::from_millis(interval);
            window.poll_resends(now, &policy(), &mut out);
        }
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_resend_exhaustion_fails() {
        let mut window = SendWindow::new(8);
        let mut now = Instant::now();
        window.queue(OutgoingMessage::with_receipt("x", "tag"));
        window.release(now, &policy(), &mut Vec::new());

        let mut out = Vec::new();
        let mut failed = Vec::new();
        for _ in 0..5 {
            now += Duration::from_secs(2);
            failed.extend(window.poll_resends(now, &policy(), &mut out));
        }

        assert_eq!(out.len(), 3);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].receipt, Some(Bytes::from("tag")));
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn test_resent_message_gives_no_rtt_sample() {
        let mut window = SendWindow::new(8);
        let now = Instant::now();
        window.queue(OutgoingMessage::new("x"));
        window.release(now, &policy(), &mut Vec::new());
        window.poll_resends(now + Duration::from_millis(150), &policy(), &mut Vec::new());

        let acked = window.on_ack(&ack_all_before(1), now + Duration::from_millis(160));
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].rtt_sample, None);
    }

    #[test]
    fn test_clear() {
        let mut window = SendWindow::new(8);
        for _ in 0..3 {
            window.queue(OutgoingMessage::new("x"));
        }
        window.release(Instant::now(), &policy(), &mut Vec::new());
        window.queue(OutgoingMessage::new("y"));

        assert_eq!(window.clear(), 4);
        assert_eq!(window.in_flight(), 0);
        assert_eq!(window.next_seq(), Seq::ZERO);
    }
}
