//! Per-channel delivery pipelines.
//!
//! A [`ChannelPipeline`] owns the send and receive state of one channel of
//! one connection. The delivery mode is fixed by the channel id and
//! selects the receiver variant once, at construction.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::core::Seq;

use super::ack::{AckRecord, AckWindow, Arrival};
use super::id::{ChannelId, DeliveryMode};
use super::reorder::ReorderBuffer;
use super::resend::{Acked, Failed, OutgoingMessage, ResendPolicy, SendWindow};

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Handed to the application (possibly with buffered successors).
    Delivered,
    /// Held in the reorder buffer.
    Buffered,
    /// Already received; dropped (and re-acked on reliable channels).
    Duplicate,
    /// Older than the last delivered message; dropped.
    Stale,
}

#[derive(Debug)]
enum Sender {
    /// Unreliable and sequenced: no retention.
    Immediate {
        next_seq: Seq,
        unsent: VecDeque<OutgoingMessage>,
    },
    Reliable(SendWindow),
}

#[derive(Debug)]
enum Receiver {
    Unreliable,
    Sequenced {
        last: Option<Seq>,
    },
    ReliableUnordered {
        acks: AckWindow,
    },
    ReliableSequenced {
        acks: AckWindow,
        last: Option<Seq>,
    },
    ReliableOrdered {
        acks: AckWindow,
        reorder: ReorderBuffer,
    },
}

/// Result of one [`ChannelPipeline::poll_transmit`] call.
#[derive(Debug, Default)]
pub struct TransmitReport {
    /// Messages that exhausted their resend budget.
    pub failed: Vec<Failed>,
    /// How many of the transmissions were retransmissions.
    pub resent: usize,
}

/// Send and receive state of one channel.
#[derive(Debug)]
pub struct ChannelPipeline {
    id: ChannelId,
    window: u16,
    sender: Sender,
    receiver: Receiver,
}

impl ChannelPipeline {
    /// Create the pipeline for `id` with an ack window of `window` sequences.
    pub fn new(id: ChannelId, window: u16) -> Self {
        let mode = id.mode();
        let sender = if mode.is_reliable() {
            Sender::Reliable(SendWindow::new(window))
        } else {
            Sender::Immediate {
                next_seq: Seq::ZERO,
                unsent: VecDeque::new(),
            }
        };
        let receiver = match mode {
            DeliveryMode::Unreliable => Receiver::Unreliable,
            DeliveryMode::Sequenced => Receiver::Sequenced { last: None },
            DeliveryMode::ReliableUnordered => Receiver::ReliableUnordered {
                acks: AckWindow::new(window),
            },
            DeliveryMode::ReliableSequenced => Receiver::ReliableSequenced {
                acks: AckWindow::new(window),
                last: None,
            },
            DeliveryMode::ReliableOrdered => Receiver::ReliableOrdered {
                acks: AckWindow::new(window),
                reorder: ReorderBuffer::new(window),
            },
        };
        Self {
            id,
            window,
            sender,
            receiver,
        }
    }

    /// The channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The delivery mode.
    pub fn mode(&self) -> DeliveryMode {
        self.id.mode()
    }

    /// Queue a message; it takes a sequence number when transmitted.
    pub fn submit(&mut self, message: OutgoingMessage) {
        match &mut self.sender {
            Sender::Immediate { unsent, .. } => unsent.push_back(message),
            Sender::Reliable(window) => window.queue(message),
        }
    }

    /// Messages queued or awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        match &self.sender {
            Sender::Immediate { unsent, .. } => unsent.len(),
            Sender::Reliable(window) => window.in_flight(),
        }
    }

    /// Collect due transmissions (resends first, then new messages).
    pub fn poll_transmit(
        &mut self,
        now: Instant,
        policy: &ResendPolicy,
        out: &mut Vec<(Seq, Bytes)>,
    ) -> TransmitReport {
        match &mut self.sender {
            Sender::Immediate { next_seq, unsent } => {
                for message in unsent.drain(..) {
                    if message.receipt.is_some() {
                        trace!(channel = %self.id, "receipt ignored on unreliable channel");
                    }
                    out.push((*next_seq, message.payload));
                    *next_seq = next_seq.next();
                }
                TransmitReport::default()
            }
            Sender::Reliable(window) => {
                let before = out.len();
                let failed = window.poll_resends(now, policy, out);
                let resent = out.len() - before;
                window.release(now, policy, out);
                TransmitReport { failed, resent }
            }
        }
    }

    /// Apply an acknowledgment record from the peer.
    pub fn on_ack(&mut self, record: &AckRecord, now: Instant) -> Vec<Acked> {
        match &mut self.sender {
            Sender::Reliable(window) => window.on_ack(record, now),
            Sender::Immediate { .. } => {
                trace!(channel = %self.id, "ack for unreliable channel ignored");
                Vec::new()
            }
        }
    }

    /// Whether a message with `seq` would be dropped without delivery.
    ///
    /// Used to discard fragments of already-received messages before
    /// reassembly. Reliable duplicates schedule an ack so the sender can
    /// retire its copy.
    pub fn is_redundant(&mut self, seq: Seq, now: Instant) -> bool {
        match &mut self.receiver {
            Receiver::Unreliable => false,
            Receiver::Sequenced { last } => last.is_some_and(|last| !seq.is_newer_than(last)),
            Receiver::ReliableUnordered { acks }
            | Receiver::ReliableSequenced { acks, .. }
            | Receiver::ReliableOrdered { acks, .. } => {
                let duplicate = acks.classify(seq) == Arrival::Duplicate;
                if duplicate {
                    acks.note_pending(now);
                }
                duplicate
            }
        }
    }

    /// Accept a complete inbound message; deliverable payloads go to `out`.
    pub fn receive(
        &mut self,
        seq: Seq,
        payload: Bytes,
        now: Instant,
        out: &mut Vec<Bytes>,
    ) -> ReceiveOutcome {
        match &mut self.receiver {
            Receiver::Unreliable => {
                out.push(payload);
                ReceiveOutcome::Delivered
            }
            Receiver::Sequenced { last } => {
                if last.is_some_and(|last| !seq.is_newer_than(last)) {
                    return ReceiveOutcome::Stale;
                }
                *last = Some(seq);
                out.push(payload);
                ReceiveOutcome::Delivered
            }
            Receiver::ReliableUnordered { acks } => {
                if !Self::accept(acks, seq, now) {
                    return ReceiveOutcome::Duplicate;
                }
                out.push(payload);
                ReceiveOutcome::Delivered
            }
            Receiver::ReliableSequenced { acks, last } => {
                if !Self::accept(acks, seq, now) {
                    return ReceiveOutcome::Duplicate;
                }
                if last.is_some_and(|last| !seq.is_newer_than(last)) {
                    return ReceiveOutcome::Stale;
                }
                *last = Some(seq);
                out.push(payload);
                ReceiveOutcome::Delivered
            }
            Receiver::ReliableOrdered { acks, reorder } => {
                if !Self::accept(acks, seq, now) {
                    return ReceiveOutcome::Duplicate;
                }
                let before = out.len();
                if !reorder.insert(seq, payload, out) {
                    return ReceiveOutcome::Duplicate;
                }
                if out.len() > before {
                    ReceiveOutcome::Delivered
                } else {
                    ReceiveOutcome::Buffered
                }
            }
        }
    }

    /// Record a reliable arrival; `false` for duplicates. Always schedules an ack.
    fn accept(acks: &mut AckWindow, seq: Seq, now: Instant) -> bool {
        acks.note_pending(now);
        match acks.classify(seq) {
            Arrival::Duplicate => false,
            Arrival::Fresh => {
                acks.record(seq);
                true
            }
            Arrival::BeyondWindow => {
                let skipped = acks.record(seq);
                trace!(seq = %seq, skipped, "receive window slid past abandoned sequences");
                true
            }
        }
    }

    /// Take the pending ack record if it is due.
    ///
    /// With `piggyback` set the record is taken as soon as one is pending;
    /// otherwise only after it waited `delay`.
    pub fn poll_ack(&mut self, now: Instant, delay: Duration, piggyback: bool) -> Option<AckRecord> {
        let acks = match &mut self.receiver {
            Receiver::ReliableUnordered { acks }
            | Receiver::ReliableSequenced { acks, .. }
            | Receiver::ReliableOrdered { acks, .. } => acks,
            Receiver::Unreliable | Receiver::Sequenced { .. } => return None,
        };
        let since = acks.pending_since()?;
        if piggyback || now.saturating_duration_since(since) >= delay {
            Some(acks.take_record(self.id))
        } else {
            None
        }
    }

    /// Whether an ack is waiting to go out.
    pub fn has_pending_ack(&self) -> bool {
        match &self.receiver {
            Receiver::ReliableUnordered { acks }
            | Receiver::ReliableSequenced { acks, .. }
            | Receiver::ReliableOrdered { acks, .. } => acks.pending_since().is_some(),
            Receiver::Unreliable | Receiver::Sequenced { .. } => false,
        }
    }

    /// Return to the initial state, abandoning queued and unacked sends.
    ///
    /// Returns how many in-flight messages were dropped.
    pub fn reset(&mut self) -> usize {
        let dropped = self.in_flight();
        *self = Self::new(self.id, self.window);
        dropped
    }
}
