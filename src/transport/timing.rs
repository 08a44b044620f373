//! RTT estimation and ping scheduling.
//!
//! RTT samples come from Ping/Pong exchanges and from acks of messages that
//! were never retransmitted.

use std::time::{Duration, Instant};

/// RTT timing constants.
pub mod constants {
    use std::time::Duration;

    /// Retransmission timeout before the first RTT sample.
    pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

    /// Minimum retransmission timeout.
    pub const MIN_RTO: Duration = Duration::from_millis(50);

    /// Maximum retransmission timeout.
    pub const MAX_RTO: Duration = Duration::from_secs(60);

    /// Clock granularity term of the RTO calculation.
    pub const GRANULARITY: Duration = Duration::from_millis(10);
}

/// Smoothed round-trip estimate (RFC 6298).
///
/// Gains are the RFC's 1/8 for the mean and 1/4 for the deviation, applied
/// in integer `Duration` arithmetic.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// `(srtt, rttvar)` once the first sample arrived.
    state: Option<(Duration, Duration)>,
}

impl RttEstimator {
    /// An estimator without samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one round-trip sample.
    pub fn update(&mut self, sample: Duration) {
        self.state = Some(match self.state {
            None => (sample, sample / 2),
            Some((srtt, rttvar)) => {
                let deviation = srtt.abs_diff(sample);
                (srtt * 7 / 8 + sample / 8, rttvar * 3 / 4 + deviation / 4)
            }
        });
    }

    /// Smoothed RTT, zero before the first sample.
    pub fn srtt(&self) -> Duration {
        self.state.map_or(Duration::ZERO, |(srtt, _)| srtt)
    }

    /// Retransmission timeout: `srtt + max(G, 4 * rttvar)`, clamped.
    pub fn rto(&self) -> Duration {
        match self.state {
            None => constants::INITIAL_RTO,
            Some((srtt, rttvar)) => (srtt + (rttvar * 4).max(constants::GRANULARITY))
                .clamp(constants::MIN_RTO, constants::MAX_RTO),
        }
    }

    /// Whether at least one sample arrived.
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }
}

/// Schedules Ping probes and matches their Pongs.
#[derive(Debug, Clone)]
pub struct PingTracker {
    interval: Duration,
    next_number: u8,
    last_sent: Option<Instant>,
    /// Probe awaiting its Pong.
    outstanding: Option<(u8, Instant)>,
}

impl PingTracker {
    /// Create a tracker that pings every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_number: 0,
            last_sent: None,
            outstanding: None,
        }
    }

    /// Number of the next Ping if one is due.
    ///
    /// A newer Ping supersedes an unanswered one.
    pub fn poll(&mut self, now: Instant) -> Option<u8> {
        if self
            .last_sent
            .is_some_and(|sent| now.saturating_duration_since(sent) < self.interval)
        {
            return None;
        }
        let number = self.next_number;
        self.next_number = self.next_number.wrapping_add(1);
        self.last_sent = Some(now);
        self.outstanding = Some((number, now));
        Some(number)
    }

    /// Match a Pong; returns the round-trip time if it answers the latest Ping.
    pub fn on_pong(&mut self, number: u8, now: Instant) -> Option<Duration> {
        match self.outstanding {
            Some((expected, sent)) if expected == number => {
                self.outstanding = None;
                Some(now.saturating_duration_since(sent))
            }
            _ => None,
        }
    }

    /// Forget schedule and outstanding probe.
    pub fn reset(&mut self) {
        self.last_sent = None;
        self.outstanding = None;
    }
}
