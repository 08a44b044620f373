//! Connection state management.
//!
//! A [`Connection`] owns everything known about one remote endpoint: status,
//! channel pipelines, reassembly table, RTT estimate and handshake timers.
//! It is mutated only from the peer's heartbeat, through
//! [`Connection::handle_unit`] for inbound traffic and
//! [`Connection::heartbeat`] for timers and outbound traffic.
//!
//! User, fragment and ack units carry the connection's epoch. Every pipeline
//! reset that keeps the connection alive moves to a new epoch, and units
//! stamped with any other epoch are dropped, so traffic delayed across a
//! reconnect can neither be delivered twice nor acknowledge new messages.
//!
//! ```text
//!  Disconnected ──connect──> Connecting ──response──> Connected ──disconnect──> Disconnecting
//!       ^                        │                     │    ^                        │
//!       │                 budget exhausted        link lost │ response               │
//!       │                        v                     v    │                        v
//!       └──────────────── Disconnected <──budget── Reconnecting               Disconnected
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::channel::{
    ChannelId, ChannelPipeline, OutgoingMessage, Reassembler, Reassembly, ReceiveOutcome,
    ResendPolicy, split,
};
use crate::core::Seq;
use crate::core::constants::CHANNEL_COUNT;
use crate::peer::PeerConfig;

use super::credits::ChannelCredits;
use super::error::{TransportError, TransportResult};
use super::frame::{SystemMessage, Unit};
use super::timing::{PingTracker, RttEstimator};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No connection (initial and terminal).
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Link lost; re-running the handshake with the same pipelines.
    Reconnecting,
    /// Handshake complete, data flows.
    Connected,
    /// Disconnect notice sent; waiting out the grace period.
    Disconnecting,
}

impl ConnectionStatus {
    /// Lowercase name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side started the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the Connect.
    Initiator,
    /// The remote sent the Connect.
    Acceptor,
}

/// Traffic and delivery counters of one connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    /// Datagrams handed to the socket.
    pub datagrams_sent: u64,
    /// Bytes handed to the socket.
    pub bytes_sent: u64,
    /// Datagrams received from the remote.
    pub datagrams_received: u64,
    /// Bytes received from the remote.
    pub bytes_received: u64,
    /// Application messages submitted.
    pub messages_sent: u64,
    /// Retransmissions of reliable messages.
    pub messages_resent: u64,
    /// Application messages delivered.
    pub messages_delivered: u64,
    /// Inbound duplicates and stale messages dropped.
    pub duplicates_dropped: u64,
    /// Reliable messages that exhausted their resends.
    pub messages_failed: u64,
    /// Smoothed round-trip time (zero until measured).
    pub rtt: Duration,
}

/// Notifications a connection raises for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Status changed.
    StatusChanged {
        /// New status.
        status: ConnectionStatus,
        /// Why, when known.
        reason: Option<String>,
        /// Hail of the remote, on `Connected`.
        remote_hail: Option<Bytes>,
    },
    /// A connect attempt failed.
    ConnectionFailed {
        /// Why.
        reason: String,
    },
    /// A message was delivered.
    Data {
        /// Channel it arrived on.
        channel: ChannelId,
        /// Payload.
        payload: Bytes,
    },
    /// A reliable message with a receipt tag was acknowledged.
    Receipt {
        /// Channel it was sent on.
        channel: ChannelId,
        /// The tag given at submission.
        tag: Bytes,
    },
    /// A reliable message exhausted its resends.
    ReceiptFailed {
        /// Channel it was sent on.
        channel: ChannelId,
        /// The tag given at submission, if any.
        tag: Option<Bytes>,
    },
    /// An incoming connection waits for [`Connection::approve`] or
    /// [`Connection::deny`].
    ApprovalRequested {
        /// Hail sent by the initiator.
        hail: Bytes,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct HandshakeTimer {
    attempts: u32,
    last_sent: Option<Instant>,
}

/// State of one remote endpoint.
#[derive(Debug)]
pub struct Connection {
    remote: SocketAddr,
    role: Role,
    status: ConnectionStatus,
    epoch: u8,
    config: Arc<PeerConfig>,
    channels: Vec<Option<ChannelPipeline>>,
    reassembler: Reassembler,
    rtt: RttEstimator,
    ping: PingTracker,
    local_hail: Bytes,
    remote_hail: Option<Bytes>,
    handshake: HandshakeTimer,
    /// Set once user data completed the handshake in place of a lost packet.
    handshake_synthesized: bool,
    /// Deadline of an incoming request held for application approval.
    approval_deadline: Option<Instant>,
    last_received: Instant,
    disconnect_at: Option<Instant>,
    disconnect_reason: Option<String>,
    credits: Arc<ChannelCredits>,
    stats: ConnectionStats,
    control: Vec<Unit>,
    events: Vec<ConnectionEvent>,
}

impl Connection {
    /// Start connecting to `remote` in `epoch`, offering `hail`.
    pub fn initiate(
        remote: SocketAddr,
        epoch: u8,
        hail: Bytes,
        config: Arc<PeerConfig>,
        now: Instant,
    ) -> Self {
        let mut connection = Self::new(remote, Role::Initiator, epoch, hail, config, now);
        connection.set_status(ConnectionStatus::Connecting, None);
        connection
    }

    /// Answer a Connect from `remote` that offered `epoch` and carried
    /// `remote_hail`.
    ///
    /// With [`PeerConfig::require_approval`] set, no response is sent until
    /// [`Connection::approve`]; an unanswered request is denied once the
    /// handshake budget has passed.
    pub fn accept(
        remote: SocketAddr,
        epoch: u8,
        remote_hail: Bytes,
        config: Arc<PeerConfig>,
        now: Instant,
    ) -> Self {
        let hail = config.response_hail.clone();
        let require_approval = config.require_approval;
        let budget = config.handshake_retry_interval * config.handshake_attempts;
        let mut connection = Self::new(remote, Role::Acceptor, epoch, hail, config, now);
        connection.remote_hail = Some(remote_hail.clone());
        connection.set_status(ConnectionStatus::Connecting, None);
        if require_approval {
            debug!(peer = %remote, "holding connection for approval");
            connection.approval_deadline = Some(now + budget);
            connection
                .events
                .push(ConnectionEvent::ApprovalRequested { hail: remote_hail });
        }
        connection
    }

    /// Use a credit table created ahead of the connection.
    ///
    /// Must be called before any credit is released through this connection.
    pub fn with_credits(mut self, credits: Arc<ChannelCredits>) -> Self {
        self.credits = credits;
        self
    }

    fn new(
        remote: SocketAddr,
        role: Role,
        epoch: u8,
        local_hail: Bytes,
        config: Arc<PeerConfig>,
        now: Instant,
    ) -> Self {
        // validation keeps the fragment count within u16
        let max_fragments = u16::try_from(config.max_fragments()).unwrap_or(u16::MAX);
        Self {
            remote,
            role,
            status: ConnectionStatus::Disconnected,
            epoch,
            channels: (0..CHANNEL_COUNT).map(|_| None).collect(),
            reassembler: Reassembler::new(
                config.reassembly_timeout,
                config.max_reassembly_groups,
                max_fragments,
            ),
            rtt: RttEstimator::new(),
            ping: PingTracker::new(config.ping_interval),
            local_hail,
            remote_hail: None,
            handshake: HandshakeTimer::default(),
            handshake_synthesized: false,
            approval_deadline: None,
            last_received: now,
            disconnect_at: None,
            disconnect_reason: None,
            credits: Arc::new(ChannelCredits::new(config.max_outstanding)),
            stats: ConnectionStats::default(),
            control: Vec::new(),
            events: Vec::new(),
            config,
        }
    }

    /// Remote endpoint.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Which side initiated.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Pipeline epoch stamped on outgoing user and ack units.
    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// Whether an incoming request still waits for the application.
    pub fn is_awaiting_approval(&self) -> bool {
        self.approval_deadline.is_some()
    }

    /// Hail received from the remote, once known.
    pub fn remote_hail(&self) -> Option<&Bytes> {
        self.remote_hail.as_ref()
    }

    /// Credit counters shared with application handles.
    pub fn credits(&self) -> &Arc<ChannelCredits> {
        &self.credits
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            rtt: self.rtt.srtt(),
            ..self.stats.clone()
        }
    }

    /// Whether the connection reached `Disconnected` and can be dropped.
    pub fn is_finished(&self) -> bool {
        self.status == ConnectionStatus::Disconnected
    }

    /// Whether new submissions are accepted.
    pub fn accepts_submissions(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Connecting
                | ConnectionStatus::Reconnecting
                | ConnectionStatus::Connected
        )
    }

    /// Messages queued or unacknowledged on `channel`.
    pub fn in_flight(&self, channel: ChannelId) -> usize {
        self.channels[channel.index()]
            .as_ref()
            .map_or(0, ChannelPipeline::in_flight)
    }

    /// Take the events raised since the last call.
    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    /// Account for a datagram from the remote.
    pub fn record_received(&mut self, bytes: usize, now: Instant) {
        self.stats.datagrams_received += 1;
        self.stats.bytes_received += bytes as u64;
        self.last_received = now;
    }

    /// Account for a datagram handed to the socket.
    pub fn record_sent(&mut self, bytes: usize) {
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += bytes as u64;
    }

    /// Queue an application message. Sent once the connection is up.
    pub fn submit(&mut self, channel: ChannelId, message: OutgoingMessage) {
        self.stats.messages_sent += 1;
        self.pipeline(channel).submit(message);
    }

    fn pipeline(&mut self, channel: ChannelId) -> &mut ChannelPipeline {
        let window = self.config.window_size;
        self.channels[channel.index()].get_or_insert_with(|| ChannelPipeline::new(channel, window))
    }

    /// Process one inbound unit.
    ///
    /// Errors are either silent drops or fatal; see
    /// [`TransportError::is_fatal`]. Fatal ones are handed to [`Connection::fail`].
    pub fn handle_unit(&mut self, unit: Unit, now: Instant) -> TransportResult<()> {
        match unit {
            Unit::System(message) => self.handle_system(message, now),
            Unit::User {
                epoch,
                channel,
                seq,
                payload,
            } => {
                self.admit(epoch, "user data", now)?;
                self.deliver(channel, seq, payload, now);
                Ok(())
            }
            Unit::Fragment { epoch, fragment } => {
                self.admit(epoch, "fragment", now)?;
                let channel = fragment.channel;
                let group = fragment.group;
                if self.pipeline(channel).is_redundant(group, now) {
                    trace!(peer = %self.remote, channel = %channel, group = %group, "fragment of a delivered message dropped");
                    self.stats.duplicates_dropped += 1;
                    return Ok(());
                }
                if let Reassembly::Complete(payload) = self.reassembler.insert(fragment, now)? {
                    self.deliver(channel, group, payload, now);
                }
                Ok(())
            }
            Unit::Ack { epoch, record } => {
                if !matches!(
                    self.status,
                    ConnectionStatus::Connected | ConnectionStatus::Reconnecting
                ) {
                    return Err(self.unexpected("ack"));
                }
                if epoch != self.epoch {
                    return Err(self.stale(self.epoch, epoch));
                }
                let channel = record.channel;
                let Some(pipeline) = self.channels[channel.index()].as_mut() else {
                    return Err(self.unexpected("ack for unused channel"));
                };
                for acked in pipeline.on_ack(&record, now) {
                    self.credits.release(channel, 1);
                    if let Some(sample) = acked.rtt_sample {
                        self.rtt.update(sample);
                    }
                    if let Some(tag) = acked.receipt {
                        self.events.push(ConnectionEvent::Receipt { channel, tag });
                    }
                }
                Ok(())
            }
        }
    }

    fn handle_system(&mut self, message: SystemMessage, now: Instant) -> TransportResult<()> {
        use ConnectionStatus::*;

        match message {
            SystemMessage::Connect { epoch, hail } => match self.status {
                Connecting if self.role == Role::Acceptor => {
                    self.epoch = epoch;
                    self.remote_hail = Some(hail);
                    if self.approval_deadline.is_none() {
                        // our response was lost; answer on this tick
                        self.handshake.last_sent = None;
                    }
                    Ok(())
                }
                Connected if epoch == self.epoch => {
                    // retry of the request that opened this epoch
                    self.control.push(Unit::System(SystemMessage::ConnectResponse {
                        epoch,
                        hail: self.local_hail.clone(),
                    }));
                    Ok(())
                }
                Connected => {
                    info!(peer = %self.remote, from = self.epoch, to = epoch, "connect on a live connection; resetting pipelines");
                    self.abandon_all();
                    self.epoch = epoch;
                    self.remote_hail = Some(hail);
                    self.control.push(Unit::System(SystemMessage::ConnectResponse {
                        epoch,
                        hail: self.local_hail.clone(),
                    }));
                    Ok(())
                }
                _ => Err(self.unexpected("connect")),
            },
            SystemMessage::ConnectResponse { epoch, hail } => match self.status {
                Connecting | Reconnecting if self.role == Role::Initiator => {
                    let expected = self.offered_epoch();
                    if epoch != expected {
                        return Err(self.stale(expected, epoch));
                    }
                    self.remote_hail = Some(hail);
                    self.establish(now);
                    Ok(())
                }
                Connected if self.role == Role::Initiator => {
                    if epoch != self.epoch {
                        return Err(self.stale(self.epoch, epoch));
                    }
                    // our ConnectionEstablished was lost
                    self.control
                        .push(Unit::System(SystemMessage::ConnectionEstablished));
                    Ok(())
                }
                _ => Err(self.unexpected("connect response")),
            },
            SystemMessage::ConnectionEstablished => match self.status {
                Connecting if self.role == Role::Acceptor && self.approval_deadline.is_none() => {
                    self.establish(now);
                    Ok(())
                }
                Connected => Ok(()),
                _ => Err(self.unexpected("connection established")),
            },
            SystemMessage::Disconnect { reason } => {
                if self.status == Disconnected {
                    return Err(self.unexpected("disconnect"));
                }
                info!(peer = %self.remote, reason = %reason, "remote disconnected");
                self.terminate(reason);
                Ok(())
            }
            SystemMessage::ConnectionRejected { reason } => match self.status {
                Connecting | Reconnecting if self.role == Role::Initiator => {
                    Err(TransportError::Rejected(reason))
                }
                _ => Err(self.unexpected("connection rejected")),
            },
            SystemMessage::Ping(number) => {
                if self.status != Connected {
                    return Err(self.unexpected("ping"));
                }
                self.control.push(Unit::System(SystemMessage::Pong(number)));
                Ok(())
            }
            SystemMessage::Pong(number) => {
                if let Some(rtt) = self.ping.on_pong(number, now) {
                    trace!(peer = %self.remote, rtt = ?rtt, "pong");
                    self.rtt.update(rtt);
                }
                Ok(())
            }
            SystemMessage::Unconnected { .. } => Err(self.unexpected("unconnected message")),
        }
    }

    /// Allow user traffic of `epoch`, completing a handshake whose last
    /// packet was lost.
    fn admit(&mut self, epoch: u8, unit: &'static str, now: Instant) -> TransportResult<()> {
        match self.status {
            ConnectionStatus::Connected => {
                if epoch != self.epoch {
                    return Err(self.stale(self.epoch, epoch));
                }
                Ok(())
            }
            ConnectionStatus::Reconnecting if epoch == self.offered_epoch() => {
                debug!(peer = %self.remote, "{unit} from the offered epoch; completing reconnect");
                self.establish(now);
                Ok(())
            }
            ConnectionStatus::Reconnecting => {
                if epoch != self.epoch {
                    return Err(self.stale(self.epoch, epoch));
                }
                Ok(())
            }
            ConnectionStatus::Connecting
                if !self.handshake_synthesized && self.approval_deadline.is_none() =>
            {
                if epoch != self.epoch {
                    return Err(self.stale(self.epoch, epoch));
                }
                debug!(peer = %self.remote, "{unit} while connecting; completing handshake");
                self.handshake_synthesized = true;
                self.establish(now);
                Ok(())
            }
            _ => Err(self.unexpected(unit)),
        }
    }

    /// Epoch the handshake in progress establishes.
    fn offered_epoch(&self) -> u8 {
        if self.status == ConnectionStatus::Reconnecting {
            self.epoch.wrapping_add(1)
        } else {
            self.epoch
        }
    }

    fn stale(&mut self, expected: u8, actual: u8) -> TransportError {
        trace!(peer = %self.remote, expected, actual, "unit from another epoch dropped");
        self.stats.duplicates_dropped += 1;
        TransportError::StaleEpoch { expected, actual }
    }

    fn establish(&mut self, now: Instant) {
        if self.status == ConnectionStatus::Reconnecting {
            self.abandon_all();
            self.epoch = self.epoch.wrapping_add(1);
        }
        self.handshake = HandshakeTimer::default();
        self.ping.reset();
        self.last_received = now;
        if self.role == Role::Initiator {
            self.control
                .push(Unit::System(SystemMessage::ConnectionEstablished));
        }
        self.set_status(ConnectionStatus::Connected, None);
    }

    fn deliver(&mut self, channel: ChannelId, seq: Seq, payload: Bytes, now: Instant) {
        let mut delivered = Vec::new();
        let outcome = self.pipeline(channel).receive(seq, payload, now, &mut delivered);
        if matches!(outcome, ReceiveOutcome::Duplicate | ReceiveOutcome::Stale) {
            trace!(peer = %self.remote, channel = %channel, seq = %seq, ?outcome, "message dropped");
            self.stats.duplicates_dropped += 1;
        }
        self.stats.messages_delivered += delivered.len() as u64;
        self.events.extend(
            delivered
                .into_iter()
                .map(|payload| ConnectionEvent::Data { channel, payload }),
        );
    }

    /// Close the connection locally with a best-effort notice.
    ///
    /// Pending reliable sends are abandoned, not drained.
    pub fn disconnect(&mut self, reason: &str, now: Instant) {
        if matches!(
            self.status,
            ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting
        ) {
            return;
        }
        let reason = truncate_reason(reason, self.config.max_hail_size());
        info!(peer = %self.remote, reason = %reason, "disconnecting");
        self.control.push(Unit::System(SystemMessage::Disconnect {
            reason: reason.clone(),
        }));
        self.abandon_all();
        self.disconnect_at = Some(now + self.config.disconnect_grace);
        self.disconnect_reason = Some(reason.clone());
        self.set_status(ConnectionStatus::Disconnecting, Some(reason));
    }

    /// Let a held incoming request proceed; the response goes out on the
    /// next heartbeat.
    ///
    /// Returns `false` when nothing was waiting for approval.
    pub fn approve(&mut self) -> bool {
        if self.approval_deadline.take().is_none() {
            return false;
        }
        info!(peer = %self.remote, "connection approved");
        self.handshake = HandshakeTimer::default();
        true
    }

    /// Refuse a held incoming request, telling the initiator why.
    ///
    /// Returns `false` when nothing was waiting for approval.
    pub fn deny(&mut self, reason: &str) -> bool {
        if self.approval_deadline.take().is_none() {
            return false;
        }
        let reason = truncate_reason(reason, self.config.max_hail_size());
        info!(peer = %self.remote, reason = %reason, "connection denied");
        self.terminate(reason.clone());
        self.control
            .push(Unit::System(SystemMessage::ConnectionRejected { reason }));
        true
    }

    /// The socket reported the remote port closed.
    pub fn on_forcible_close(&mut self) {
        let error = if self.status == ConnectionStatus::Connecting {
            TransportError::NotListening
        } else {
            TransportError::ForciblyClosed
        };
        self.fail(error);
    }

    /// End the connection because of a fatal error.
    pub fn fail(&mut self, error: TransportError) {
        warn!(peer = %self.remote, error = %error, "connection failed");
        self.terminate(error.to_string());
    }

    fn terminate(&mut self, reason: String) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        let failed_attempt =
            self.role == Role::Initiator && self.status == ConnectionStatus::Connecting;
        self.abandon_all();
        self.control.clear();
        if failed_attempt {
            self.events.push(ConnectionEvent::ConnectionFailed {
                reason: reason.clone(),
            });
        }
        self.set_status(ConnectionStatus::Disconnected, Some(reason));
    }

    /// Reset every pipeline and the reassembly table, returning credits.
    fn abandon_all(&mut self) {
        for pipeline in self.channels.iter_mut().flatten() {
            let channel = pipeline.id();
            let dropped = pipeline.reset();
            if dropped > 0 {
                debug!(peer = %self.remote, channel = %channel, dropped, "abandoning in-flight messages");
            }
            self.credits.release(channel, dropped);
        }
        self.reassembler.clear();
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: Option<String>) {
        if self.status == status {
            return;
        }
        debug!(peer = %self.remote, from = %self.status, to = %status, "status changed");
        self.status = status;
        let remote_hail = if status == ConnectionStatus::Connected {
            self.remote_hail.clone()
        } else {
            None
        };
        self.events.push(ConnectionEvent::StatusChanged {
            status,
            reason,
            remote_hail,
        });
    }

    fn unexpected(&self, unit: &'static str) -> TransportError {
        TransportError::UnexpectedUnit {
            unit,
            status: self.status.as_str(),
        }
    }

    /// Run timers and collect this tick's outbound units into `out`.
    pub fn heartbeat(&mut self, now: Instant, out: &mut Vec<Unit>) {
        if let Err(error) = self.tick_lifecycle(now) {
            self.fail(error);
        }
        out.append(&mut self.control);
        if self.status != ConnectionStatus::Connected {
            return;
        }

        let purged = self.reassembler.purge_expired(now);
        if purged > 0 {
            debug!(peer = %self.remote, purged, "incomplete messages expired");
        }
        self.poll_channels(now, out);
        let piggyback = !out.is_empty();
        let ack_delay = self.config.ack_delay;
        let epoch = self.epoch;
        for pipeline in self.channels.iter_mut().flatten() {
            if let Some(record) = pipeline.poll_ack(now, ack_delay, piggyback) {
                out.push(Unit::Ack { epoch, record });
            }
        }
    }

    fn tick_lifecycle(&mut self, now: Instant) -> TransportResult<()> {
        match self.status {
            ConnectionStatus::Connecting if self.approval_deadline.is_some() => {
                if self.approval_deadline.is_some_and(|deadline| now >= deadline) {
                    warn!(peer = %self.remote, "connection approval timed out");
                    self.deny("connection approval timed out");
                }
                Ok(())
            }
            ConnectionStatus::Connecting => self.tick_handshake(now, TransportError::HandshakeTimeout),
            ConnectionStatus::Reconnecting => {
                self.tick_handshake(now, TransportError::ConnectionTimeout)
            }
            ConnectionStatus::Connected => {
                let silence = now.saturating_duration_since(self.last_received);
                if silence >= self.config.connection_timeout {
                    if self.role == Role::Acceptor {
                        return Err(TransportError::ConnectionTimeout);
                    }
                    warn!(peer = %self.remote, silence = ?silence, "link lost; reconnecting");
                    self.handshake = HandshakeTimer::default();
                    self.set_status(
                        ConnectionStatus::Reconnecting,
                        Some("no traffic from remote host".into()),
                    );
                    return self.tick_handshake(now, TransportError::ConnectionTimeout);
                }
                if let Some(number) = self.ping.poll(now) {
                    self.control.push(Unit::System(SystemMessage::Ping(number)));
                }
                Ok(())
            }
            ConnectionStatus::Disconnecting => {
                if self.disconnect_at.is_none_or(|at| now >= at) {
                    let reason = self.disconnect_reason.take();
                    self.set_status(ConnectionStatus::Disconnected, reason);
                }
                Ok(())
            }
            ConnectionStatus::Disconnected => Ok(()),
        }
    }

    fn tick_handshake(&mut self, now: Instant, timeout: TransportError) -> TransportResult<()> {
        if let Some(last) = self.handshake.last_sent
            && now.saturating_duration_since(last) < self.config.handshake_retry_interval
        {
            return Ok(());
        }
        if self.handshake.attempts >= self.config.handshake_attempts {
            return Err(timeout);
        }
        self.handshake.attempts += 1;
        self.handshake.last_sent = Some(now);

        let epoch = self.offered_epoch();
        let hail = self.local_hail.clone();
        let message = match self.role {
            Role::Initiator => SystemMessage::Connect { epoch, hail },
            Role::Acceptor => SystemMessage::ConnectResponse { epoch, hail },
        };
        debug!(peer = %self.remote, attempt = self.handshake.attempts, epoch, subtype = message.subtype(), "sending handshake");
        self.control.push(Unit::System(message));
        Ok(())
    }

    /// Retransmission timing, stretched to the measured RTO once known.
    fn resend_policy(&self) -> ResendPolicy {
        let mut policy = self.config.resend_policy();
        if self.rtt.is_initialized() {
            policy.initial_delay = self.rtt.rto().clamp(policy.initial_delay, policy.max_delay);
        }
        policy
    }

    fn poll_channels(&mut self, now: Instant, out: &mut Vec<Unit>) {
        let policy = self.resend_policy();
        let max_unfragmented = self.config.max_unfragmented();
        let fragment_size = self.config.fragment_size();
        let epoch = self.epoch;
        let mut transmissions = Vec::new();

        for pipeline in self.channels.iter_mut().flatten() {
            let channel = pipeline.id();
            let report = pipeline.poll_transmit(now, &policy, &mut transmissions);
            self.stats.messages_resent += report.resent as u64;

            for failed in report.failed {
                warn!(peer = %self.remote, channel = %channel, seq = %failed.seq, "reliable message failed");
                self.stats.messages_failed += 1;
                self.credits.release(channel, 1);
                self.events.push(ConnectionEvent::ReceiptFailed {
                    channel,
                    tag: failed.receipt,
                });
            }

            for (seq, payload) in transmissions.drain(..) {
                if payload.len() <= max_unfragmented {
                    out.push(Unit::User {
                        epoch,
                        channel,
                        seq,
                        payload,
                    });
                } else {
                    out.extend(
                        split(channel, seq, &payload, fragment_size)
                            .into_iter()
                            .map(|fragment| Unit::Fragment { epoch, fragment }),
                    );
                }
            }
        }
    }
}

/// Cut `reason` to at most `max` bytes on a character boundary.
fn truncate_reason(reason: &str, max: usize) -> String {
    if reason.len() <= max {
        return reason.to_owned();
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AckRecord;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn config() -> Arc<PeerConfig> {
        Arc::new(
            PeerConfig::builder()
                .mtu(256)
                .handshake(Duration::from_millis(100), 3)
                .resend_delay(Duration::from_millis(100), Duration::from_secs(1))
                .max_resends(3)
                .ping_interval(Duration::from_secs(60))
                .connection_timeout(Duration::from_secs(5))
                .response_hail("welcome")
                .build()
                .unwrap(),
        )
    }

    fn tick(connection: &mut Connection, now: Instant) -> Vec<Unit> {
        let mut out = Vec::new();
        connection.heartbeat(now, &mut out);
        out
    }

    fn feed(connection: &mut Connection, units: Vec<Unit>, now: Instant) {
        for unit in units {
            connection.record_received(0, now);
            let _ = connection.handle_unit(unit, now);
        }
    }

    fn events(connection: &mut Connection) -> Vec<ConnectionEvent> {
        connection.drain_events().collect()
    }

    fn assert_rtt(connection: &Connection, expected: Duration) {
        let rtt = connection.stats().rtt;
        assert!(rtt.abs_diff(expected) < Duration::from_micros(10), "rtt {rtt:?}");
    }

    fn connected_pair(now: Instant) -> (Connection, Connection) {
        let mut client = Connection::initiate(test_addr(1), 7, Bytes::from("hi"), config(), now);
        let connect = tick(&mut client, now);
        let (epoch, hail) = match &connect[..] {
            [Unit::System(SystemMessage::Connect { epoch, hail })] => (*epoch, hail.clone()),
            other => panic!("expected connect, got {other:?}"),
        };
        let mut server = Connection::accept(test_addr(2), epoch, hail, config(), now);
        let response = tick(&mut server, now);
        feed(&mut client, response, now);
        let established = tick(&mut client, now);
        feed(&mut server, established, now);
        // swallow the first ping exchange so later ticks stay quiet
        tick(&mut server, now);
        events(&mut client);
        events(&mut server);
        (client, server)
    }

    #[test]
    fn test_three_way_handshake() {
        let now = Instant::now();
        let mut client = Connection::initiate(test_addr(1), 7, Bytes::from("hi"), config(), now);
        assert_eq!(client.status(), ConnectionStatus::Connecting);

        let connect = tick(&mut client, now);
        assert_eq!(
            connect,
            vec![Unit::System(SystemMessage::Connect {
                epoch: 7,
                hail: Bytes::from("hi")
            })]
        );

        let mut server = Connection::accept(test_addr(2), 7, Bytes::from("hi"), config(), now);
        let response = tick(&mut server, now);
        assert_eq!(
            response,
            vec![Unit::System(SystemMessage::ConnectResponse {
                epoch: 7,
                hail: Bytes::from("welcome")
            })]
        );

        feed(&mut client, response, now);
        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert!(events(&mut client).contains(&ConnectionEvent::StatusChanged {
            status: ConnectionStatus::Connected,
            reason: None,
            remote_hail: Some(Bytes::from("welcome")),
        }));

        let established = tick(&mut client, now);
        assert!(established.contains(&Unit::System(SystemMessage::ConnectionEstablished)));
        feed(&mut server, established, now);
        assert_eq!(server.status(), ConnectionStatus::Connected);
        assert_eq!(server.remote_hail(), Some(&Bytes::from("hi")));
    }

    #[test]
    fn test_handshake_budget_exhausted() {
        let start = Instant::now();
        let mut client = Connection::initiate(test_addr(1), 7, Bytes::new(), config(), start);

        let mut connects = 0;
        for step in 0..10 {
            let now = start + Duration::from_millis(50 * step);
            connects += tick(&mut client, now).len();
        }

        assert_eq!(connects, 3);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        let failures: Vec<_> = events(&mut client)
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::ConnectionFailed { .. }))
            .collect();
        assert_eq!(
            failures,
            vec![ConnectionEvent::ConnectionFailed {
                reason: TransportError::HandshakeTimeout.to_string()
            }]
        );
    }

    #[test]
    fn test_user_data_completes_lost_handshake() {
        let now = Instant::now();
        let (mut client, _) = connected_pair(now);

        // the acceptor never saw ConnectionEstablished
        let epoch = client.epoch();
        let mut server = Connection::accept(test_addr(2), epoch, Bytes::new(), config(), now);
        tick(&mut server, now);
        events(&mut server);

        client.submit(ChannelId::UNRELIABLE, OutgoingMessage::new("data"));
        let data = tick(&mut client, now);
        feed(&mut server, data, now);

        assert_eq!(server.status(), ConnectionStatus::Connected);
        let events = events(&mut server);
        assert!(matches!(
            events[0],
            ConnectionEvent::StatusChanged {
                status: ConnectionStatus::Connected,
                ..
            }
        ));
        assert_eq!(
            events[1],
            ConnectionEvent::Data {
                channel: ChannelId::UNRELIABLE,
                payload: Bytes::from("data")
            }
        );

        // the late ConnectionEstablished changes nothing
        feed(
            &mut server,
            vec![Unit::System(SystemMessage::ConnectionEstablished)],
            now,
        );
        assert!(server.drain_events().next().is_none());
    }

    #[test]
    fn test_forcible_close_while_connecting() {
        let now = Instant::now();
        let mut client = Connection::initiate(test_addr(1), 7, Bytes::new(), config(), now);
        tick(&mut client, now);
        client.on_forcible_close();

        assert!(client.is_finished());
        assert!(events(&mut client).contains(&ConnectionEvent::ConnectionFailed {
            reason: "failed to connect: remote host is not listening".into()
        }));
    }

    #[test]
    fn test_forcible_close_when_connected() {
        let now = Instant::now();
        let (mut client, _) = connected_pair(now);
        client.on_forcible_close();

        let events = events(&mut client);
        assert_eq!(
            events,
            vec![ConnectionEvent::StatusChanged {
                status: ConnectionStatus::Disconnected,
                reason: Some("connection forcibly closed by remote host".into()),
                remote_hail: None,
            }]
        );
    }

    #[test]
    fn test_rejected_connection() {
        let now = Instant::now();
        let mut client = Connection::initiate(test_addr(1), 7, Bytes::new(), config(), now);
        tick(&mut client, now);

        let result = client.handle_unit(
            Unit::System(SystemMessage::ConnectionRejected {
                reason: "server full".into(),
            }),
            now,
        );
        let error = result.unwrap_err();
        assert!(error.is_fatal());
        client.fail(error);

        assert!(events(&mut client).contains(&ConnectionEvent::ConnectionFailed {
            reason: "connection rejected: server full".into()
        }));
    }

    #[test]
    fn test_local_disconnect_sends_notice() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);
        assert!(client.credits().try_acquire(ChannelId::RELIABLE_UNORDERED));
        client.submit(ChannelId::RELIABLE_UNORDERED, OutgoingMessage::new("lost"));

        client.disconnect("bye", now);
        assert_eq!(client.status(), ConnectionStatus::Disconnecting);
        assert_eq!(client.in_flight(ChannelId::RELIABLE_UNORDERED), 0);
        assert_eq!(client.credits().in_flight(ChannelId::RELIABLE_UNORDERED), 0);

        let out = tick(&mut client, now);
        assert_eq!(
            out,
            vec![Unit::System(SystemMessage::Disconnect {
                reason: "bye".into()
            })]
        );
        assert!(client.is_finished());

        feed(&mut server, out, now);
        assert!(server.is_finished());
        assert!(events(&mut server).contains(&ConnectionEvent::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason: Some("bye".into()),
            remote_hail: None,
        }));
    }

    #[test]
    fn test_link_loss() {
        let start = Instant::now();
        let (mut client, mut server) = connected_pair(start);
        let later = start + Duration::from_secs(6);

        let out = tick(&mut client, later);
        assert_eq!(client.status(), ConnectionStatus::Reconnecting);
        assert!(matches!(
            out[..],
            [Unit::System(SystemMessage::Connect { .. })]
        ));

        tick(&mut server, later);
        assert!(server.is_finished());
        assert!(events(&mut server).contains(&ConnectionEvent::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason: Some("connection timed out".into()),
            remote_hail: None,
        }));

        // reconnect budget runs out
        for step in 1..=3 {
            tick(&mut client, later + Duration::from_millis(100 * step));
        }
        assert!(client.is_finished());
        let reasons: Vec<_> = events(&mut client)
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::StatusChanged { status, reason, .. } => Some((status, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons.last(),
            Some(&(
                ConnectionStatus::Disconnected,
                Some("connection timed out".to_string())
            ))
        );
    }

    #[test]
    fn test_ack_releases_credit_and_reports_receipt() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);
        let channel = ChannelId::reliable_ordered(1).unwrap();

        assert!(client.credits().try_acquire(channel));
        client.submit(channel, OutgoingMessage::with_receipt("payload", "tag-1"));
        let data = tick(&mut client, now);
        feed(&mut server, data, now);

        let ack = tick(&mut server, now + Duration::from_millis(30));
        assert!(matches!(ack[..], [Unit::Ack { .. }]));
        feed(&mut client, ack, now + Duration::from_millis(30));

        assert_eq!(client.credits().in_flight(channel), 0);
        assert_eq!(client.in_flight(channel), 0);
        assert!(events(&mut client).contains(&ConnectionEvent::Receipt {
            channel,
            tag: Bytes::from("tag-1")
        }));
        assert_rtt(&client, Duration::from_millis(30));
    }

    #[test]
    fn test_resend_exhaustion_reports_failure() {
        let start = Instant::now();
        let (mut client, _) = connected_pair(start);
        let channel = ChannelId::RELIABLE_UNORDERED;

        assert!(client.credits().try_acquire(channel));
        client.submit(channel, OutgoingMessage::new("void"));
        tick(&mut client, start);

        for step in 1..=20 {
            let now = start + Duration::from_millis(250 * step);
            client.record_received(0, now);
            tick(&mut client, now);
        }

        assert_eq!(client.stats().messages_resent, 3);
        assert_eq!(client.stats().messages_failed, 1);
        assert_eq!(client.credits().in_flight(channel), 0);
        assert!(events(&mut client).contains(&ConnectionEvent::ReceiptFailed { channel, tag: None }));
        assert_eq!(client.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_large_message_fragmented() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);
        let channel = ChannelId::reliable_ordered(2).unwrap();
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();

        client.submit(channel, OutgoingMessage::new(payload.clone()));
        let units = tick(&mut client, now);
        assert_eq!(units.len(), 5);
        assert!(units.iter().all(|u| matches!(u, Unit::Fragment { epoch: 7, .. })));

        // deliver in reverse order
        feed(&mut server, units.into_iter().rev().collect(), now);
        assert_eq!(
            events(&mut server),
            vec![ConnectionEvent::Data {
                channel,
                payload: Bytes::from(payload)
            }]
        );
    }

    #[test]
    fn test_stale_ack_before_connect_dropped() {
        let now = Instant::now();
        let mut client = Connection::initiate(test_addr(1), 7, Bytes::new(), config(), now);
        let result = client.handle_unit(
            Unit::Ack {
                epoch: 7,
                record: AckRecord {
                    channel: ChannelId::RELIABLE_UNORDERED,
                    base: Seq::new(1),
                    bits: vec![0],
                },
            },
            now,
        );
        assert!(result.unwrap_err().is_silent_drop());
    }

    #[test]
    fn test_traffic_held_across_reconnect_is_dropped() {
        let start = Instant::now();
        let (mut client, mut server) = connected_pair(start);
        let channel = ChannelId::reliable_ordered(1).unwrap();

        assert!(client.credits().try_acquire(channel));
        client.submit(channel, OutgoingMessage::with_receipt("old", "old-tag"));
        let held_data = tick(&mut client, start);
        feed(&mut server, held_data.clone(), start);
        assert_eq!(
            events(&mut server),
            vec![ConnectionEvent::Data {
                channel,
                payload: Bytes::from("old")
            }]
        );
        // the ack for "old" is held back by the network
        let held_ack = tick(&mut server, start + Duration::from_millis(30));
        assert!(matches!(held_ack[..], [Unit::Ack { epoch: 7, .. }]));

        // link lost, reconnect into epoch 8
        let later = start + Duration::from_secs(6);
        let connect = tick(&mut client, later);
        assert_eq!(client.status(), ConnectionStatus::Reconnecting);
        assert!(matches!(
            connect[..],
            [Unit::System(SystemMessage::Connect { epoch: 8, .. })]
        ));
        feed(&mut server, connect, later);
        assert_eq!(server.epoch(), 8);
        let response: Vec<_> = tick(&mut server, later)
            .into_iter()
            .filter(|u| matches!(u, Unit::System(SystemMessage::ConnectResponse { .. })))
            .collect();
        feed(&mut client, response, later);
        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert_eq!(client.epoch(), 8);
        assert_eq!(client.in_flight(channel), 0);
        events(&mut client);

        // the new pipeline reuses sequence 0
        assert!(client.credits().try_acquire(channel));
        client.submit(channel, OutgoingMessage::with_receipt("fresh", "new-tag"));
        let fresh = tick(&mut client, later);

        feed(&mut client, held_ack, later);
        assert_eq!(client.in_flight(channel), 1);
        assert_eq!(client.credits().in_flight(channel), 1);
        assert!(
            !events(&mut client)
                .iter()
                .any(|e| matches!(e, ConnectionEvent::Receipt { .. }))
        );

        feed(&mut server, held_data, later);
        assert!(events(&mut server).is_empty());

        feed(&mut server, fresh, later);
        assert_eq!(
            events(&mut server),
            vec![ConnectionEvent::Data {
                channel,
                payload: Bytes::from("fresh")
            }]
        );
        let ack = tick(&mut server, later + Duration::from_millis(30));
        feed(&mut client, ack, later + Duration::from_millis(30));
        assert_eq!(client.in_flight(channel), 0);
        assert_eq!(
            events(&mut client),
            vec![ConnectionEvent::Receipt {
                channel,
                tag: Bytes::from("new-tag")
            }]
        );
    }

    #[test]
    fn test_repeated_connect_keeps_epoch_pipelines() {
        let now = Instant::now();
        let (_, mut server) = connected_pair(now);
        let channel = ChannelId::RELIABLE_UNORDERED;
        server.submit(channel, OutgoingMessage::new("queued"));

        // a retried Connect of the live epoch is answered without a reset
        feed(
            &mut server,
            vec![Unit::System(SystemMessage::Connect {
                epoch: 7,
                hail: Bytes::from("hi"),
            })],
            now,
        );
        assert_eq!(server.in_flight(channel), 1);
        assert!(tick(&mut server, now).contains(&Unit::System(SystemMessage::ConnectResponse {
            epoch: 7,
            hail: Bytes::from("welcome"),
        })));
        assert_eq!(server.epoch(), 7);
    }

    #[test]
    fn test_response_from_other_epoch_ignored() {
        let now = Instant::now();
        let mut client = Connection::initiate(test_addr(1), 7, Bytes::new(), config(), now);
        tick(&mut client, now);

        let result = client.handle_unit(
            Unit::System(SystemMessage::ConnectResponse {
                epoch: 6,
                hail: Bytes::new(),
            }),
            now,
        );
        assert!(result.unwrap_err().is_silent_drop());
        assert_eq!(client.status(), ConnectionStatus::Connecting);
        assert_eq!(client.stats().duplicates_dropped, 1);
    }

    fn approval_config() -> Arc<PeerConfig> {
        Arc::new(
            PeerConfig::builder()
                .mtu(256)
                .handshake(Duration::from_millis(100), 3)
                .require_approval(true)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_approval_holds_response() {
        let now = Instant::now();
        let hail = Bytes::from("let me in");
        let mut server = Connection::accept(test_addr(2), 3, hail, approval_config(), now);
        assert!(server.is_awaiting_approval());
        assert!(events(&mut server).contains(&ConnectionEvent::ApprovalRequested {
            hail: Bytes::from("let me in")
        }));
        assert!(tick(&mut server, now).is_empty());

        // user data cannot bypass approval
        let result = server.handle_unit(
            Unit::User {
                epoch: 3,
                channel: ChannelId::UNRELIABLE,
                seq: Seq::ZERO,
                payload: Bytes::from("early"),
            },
            now,
        );
        assert!(result.unwrap_err().is_silent_drop());
        assert_eq!(server.status(), ConnectionStatus::Connecting);

        assert!(server.approve());
        assert!(!server.approve());
        assert_eq!(
            tick(&mut server, now + Duration::from_millis(10)),
            vec![Unit::System(SystemMessage::ConnectResponse {
                epoch: 3,
                hail: Bytes::new(),
            })]
        );
    }

    #[test]
    fn test_deny_sends_rejection() {
        let now = Instant::now();
        let mut server = Connection::accept(test_addr(2), 3, Bytes::new(), approval_config(), now);
        assert!(server.deny("go away"));
        assert!(server.is_finished());
        assert_eq!(
            tick(&mut server, now),
            vec![Unit::System(SystemMessage::ConnectionRejected {
                reason: "go away".into()
            })]
        );
    }

    #[test]
    fn test_unanswered_approval_times_out() {
        let start = Instant::now();
        let mut server =
            Connection::accept(test_addr(2), 3, Bytes::new(), approval_config(), start);

        assert!(tick(&mut server, start + Duration::from_millis(299)).is_empty());
        assert!(!server.is_finished());

        let out = tick(&mut server, start + Duration::from_millis(300));
        assert_eq!(
            out,
            vec![Unit::System(SystemMessage::ConnectionRejected {
                reason: "connection approval timed out".into()
            })]
        );
        assert!(server.is_finished());
    }

    #[test]
    fn test_ping_pong_measures_rtt() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        client.ping = PingTracker::new(Duration::from_secs(1));
        let out = tick(&mut client, now);
        let ping = out
            .into_iter()
            .filter(|u| matches!(u, Unit::System(SystemMessage::Ping(_))))
            .collect::<Vec<_>>();
        assert_eq!(ping.len(), 1);

        feed(&mut server, ping, now);
        let pong: Vec<_> = tick(&mut server, now)
            .into_iter()
            .filter(|u| matches!(u, Unit::System(SystemMessage::Pong(_))))
            .collect();
        assert_eq!(pong.len(), 1);

        feed(&mut client, pong, now + Duration::from_millis(80));
        assert_rtt(&client, Duration::from_millis(80));
    }

    #[test]
    fn test_truncate_reason() {
        assert_eq!(truncate_reason("short", 10), "short");
        assert_eq!(truncate_reason("abcdef", 3), "abc");
        // never splits a multi-byte character
        assert_eq!(truncate_reason("aé", 2), "a");
    }
}
