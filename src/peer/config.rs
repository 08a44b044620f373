//! Peer configuration.

use std::time::Duration;

use bytes::Bytes;

use crate::channel::ResendPolicy;
use crate::core::ConfigError;
use crate::core::constants::*;

/// Tunables of a [`Peer`](super::Peer).
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    /// Largest datagram the peer assembles (bytes).
    pub mtu: usize,
    /// Largest application message accepted by `send`.
    pub max_message_size: usize,
    /// Sequences covered by one ack record; a power of two in `8..=1024`.
    pub window_size: u16,
    /// In-flight messages allowed per reliable channel before backpressure.
    pub max_outstanding: usize,
    /// First retransmission timeout.
    pub initial_resend_delay: Duration,
    /// Upper bound for the doubling retransmission timeout.
    pub max_resend_delay: Duration,
    /// Retransmissions before a message is reported as failed.
    pub max_resends: u32,
    /// Longest an ack waits for outgoing traffic to ride on.
    pub ack_delay: Duration,
    /// Lifetime of an incomplete reassembly group.
    pub reassembly_timeout: Duration,
    /// Concurrent reassembly groups per connection.
    pub max_reassembly_groups: usize,
    /// Interval between handshake retries.
    pub handshake_retry_interval: Duration,
    /// Handshake messages sent before giving up.
    pub handshake_attempts: u32,
    /// Interval between pings on a connected link.
    pub ping_interval: Duration,
    /// Silence after which a connected link is considered lost.
    pub connection_timeout: Duration,
    /// Time spent in `Disconnecting` before `Disconnected`.
    pub disconnect_grace: Duration,
    /// Accept connection requests from unknown endpoints.
    pub accept_incoming: bool,
    /// Hold accepted requests until the application approves or denies them.
    pub require_approval: bool,
    /// Hail payload returned to initiators in the connect response.
    pub response_hail: Bytes,
    /// Simultaneous connections allowed.
    pub max_connections: usize,
    /// Surface dropped-input diagnostics as events.
    pub diagnostics: bool,
    /// Datagram buffers kept for reuse.
    pub pooled_buffers: usize,
    /// Tick interval of the tokio driver.
    pub heartbeat_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            initial_resend_delay: DEFAULT_INITIAL_RESEND_DELAY,
            max_resend_delay: DEFAULT_MAX_RESEND_DELAY,
            max_resends: DEFAULT_MAX_RESENDS,
            ack_delay: DEFAULT_ACK_DELAY,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_reassembly_groups: DEFAULT_MAX_REASSEMBLY_GROUPS,
            handshake_retry_interval: DEFAULT_HANDSHAKE_RETRY_INTERVAL,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            ping_interval: DEFAULT_PING_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            accept_incoming: false,
            require_approval: DEFAULT_REQUIRE_APPROVAL,
            response_hail: Bytes::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            diagnostics: false,
            pooled_buffers: DEFAULT_POOLED_BUFFERS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl PeerConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::new()
    }

    /// Check every setting for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MIN_MTU {
            return Err(ConfigError::MtuTooSmall {
                mtu: self.mtu,
                min: MIN_MTU,
            });
        }
        if self.mtu > MAX_MTU {
            return Err(ConfigError::MtuTooLarge {
                mtu: self.mtu,
                max: MAX_MTU,
            });
        }
        if !self.window_size.is_power_of_two()
            || !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.window_size)
        {
            return Err(ConfigError::InvalidWindowSize(self.window_size));
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::Zero("max_outstanding"));
        }
        if self.max_outstanding > self.window_size as usize {
            return Err(ConfigError::OutstandingExceedsWindow {
                outstanding: self.max_outstanding,
                window: self.window_size,
            });
        }
        if self.response_hail.len() > self.max_hail_size() {
            return Err(ConfigError::HailTooLarge {
                size: self.response_hail.len(),
                max: self.max_hail_size(),
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("max_message_size"));
        }
        if self.max_fragments() > u16::MAX as usize {
            return Err(ConfigError::TooManyFragments {
                size: self.max_message_size,
                max_fragments: u16::MAX as usize,
            });
        }

        let positive = [
            (self.initial_resend_delay, "initial_resend_delay"),
            (self.reassembly_timeout, "reassembly_timeout"),
            (self.handshake_retry_interval, "handshake_retry_interval"),
            (self.ping_interval, "ping_interval"),
            (self.connection_timeout, "connection_timeout"),
            (self.heartbeat_interval, "heartbeat_interval"),
        ];
        if let Some(&(_, name)) = positive.iter().find(|(value, _)| value.is_zero()) {
            return Err(ConfigError::Zero(name));
        }
        if self.initial_resend_delay > self.max_resend_delay {
            return Err(ConfigError::ResendDelayOrder);
        }
        if self.handshake_attempts == 0 {
            return Err(ConfigError::Zero("handshake_attempts"));
        }
        if self.max_reassembly_groups == 0 {
            return Err(ConfigError::Zero("max_reassembly_groups"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }
        Ok(())
    }

    /// Payload bytes carried by one fragment.
    pub fn fragment_size(&self) -> usize {
        self.mtu - FRAGMENT_HEADER_SIZE
    }

    /// Fragments needed for the largest message; incoming groups claiming
    /// more are refused.
    pub fn max_fragments(&self) -> usize {
        self.max_message_size.div_ceil(self.fragment_size())
    }

    /// Largest payload sent as a single unfragmented unit.
    pub fn max_unfragmented(&self) -> usize {
        self.mtu - USER_HEADER_SIZE
    }

    /// Largest hail carried by a handshake unit, after its epoch byte.
    ///
    /// Also bounds disconnect and rejection reasons.
    pub fn max_hail_size(&self) -> usize {
        self.mtu - SYSTEM_HEADER_SIZE - HANDSHAKE_EPOCH_SIZE
    }

    /// Retransmission timing derived from this configuration.
    pub fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy {
            initial_delay: self.initial_resend_delay,
            max_delay: self.max_resend_delay,
            max_resends: self.max_resends,
        }
    }
}

/// Fluent builder for [`PeerConfig`].
#[derive(Debug, Clone, Default)]
pub struct PeerConfigBuilder {
    config: PeerConfig,
}

impl PeerConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the MTU.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the ack window size.
    pub fn window_size(mut self, size: u16) -> Self {
        self.config.window_size = size;
        self
    }

    /// Set the per-channel in-flight limit.
    pub fn max_outstanding(mut self, max: usize) -> Self {
        self.config.max_outstanding = max;
        self
    }

    /// Set the initial and maximum retransmission timeouts.
    pub fn resend_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_resend_delay = initial;
        self.config.max_resend_delay = max;
        self
    }

    /// Set the retransmission budget.
    pub fn max_resends(mut self, max: u32) -> Self {
        self.config.max_resends = max;
        self
    }

    /// Set the ack flush delay.
    pub fn ack_delay(mut self, delay: Duration) -> Self {
        self.config.ack_delay = delay;
        self
    }

    /// Set the reassembly group timeout.
    pub fn reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.config.reassembly_timeout = timeout;
        self
    }

    /// Set the concurrent reassembly group limit.
    pub fn max_reassembly_groups(mut self, max: usize) -> Self {
        self.config.max_reassembly_groups = max;
        self
    }

    /// Set the handshake retry interval and attempt budget.
    pub fn handshake(mut self, interval: Duration, attempts: u32) -> Self {
        self.config.handshake_retry_interval = interval;
        self.config.handshake_attempts = attempts;
        self
    }

    /// Set the ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Set the link-loss timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the disconnect grace period.
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    /// Accept or refuse incoming connection requests.
    pub fn accept_incoming(mut self, accept: bool) -> Self {
        self.config.accept_incoming = accept;
        self
    }

    /// Hold incoming connections until `PeerHandle::approve` or
    /// `PeerHandle::deny` answers them.
    pub fn require_approval(mut self, required: bool) -> Self {
        self.config.require_approval = required;
        self
    }

    /// Set the hail returned in connect responses.
    pub fn response_hail(mut self, hail: impl Into<Bytes>) -> Self {
        self.config.response_hail = hail.into();
        self
    }

    /// Set the connection limit.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Enable or disable diagnostic events.
    pub fn diagnostics(mut self, enabled: bool) -> Self {
        self.config.diagnostics = enabled;
        self
    }

    /// Set the number of pooled datagram buffers.
    pub fn pooled_buffers(mut self, count: usize) -> Self {
        self.config.pooled_buffers = count;
        self
    }

    /// Set the driver tick interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<PeerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
