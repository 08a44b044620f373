//! The heartbeat-owned engine.
//!
//! A [`Peer`] owns every [`Connection`] of one socket. All of their state is
//! read and mutated inside [`Peer::heartbeat`], which drains the socket,
//! applies queued commands, runs connection timers and flushes outbound
//! datagrams, in that order. Nothing inside it blocks and nothing escapes it:
//! malformed input is dropped, failures become events.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::core::ConfigError;
use crate::transport::{
    BufferPool, ChannelCredits, Connection, ConnectionStats, ConnectionStatus, DatagramPacker,
    DatagramSocket, RECV_BUFFER_SIZE, SystemMessage, TransportError, Unit, UnitReader,
    is_forcible_close,
};

use super::config::PeerConfig;
use super::event::PeerEvent;
use super::handle::{Command, PeerEvents, PeerHandle, Registry};

/// Connection-owning engine of one socket.
#[derive(Debug)]
pub struct Peer {
    config: Arc<PeerConfig>,
    connections: FxHashMap<SocketAddr, Connection>,
    registry: Registry,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<PeerEvent>,
    pool: BufferPool,
    recv_buf: Vec<u8>,
    /// Connectionless units (rejections, discovery) waiting for the flush.
    outbox: Vec<(SocketAddr, Unit)>,
    /// Target of the last send; socket errors are attributed to it.
    last_target: Option<SocketAddr>,
    stopping: bool,
}

impl Peer {
    /// Create an engine with its application handle and event queue.
    pub fn new(config: PeerConfig) -> Result<(Self, PeerHandle, PeerEvents), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = Registry::default();

        let handle = PeerHandle::new(
            Arc::clone(&config),
            command_tx,
            Arc::clone(&registry),
            Arc::new(AtomicBool::new(false)),
        );
        let peer = Self {
            pool: BufferPool::new(config.mtu, config.pooled_buffers),
            recv_buf: vec![0; RECV_BUFFER_SIZE],
            connections: FxHashMap::default(),
            registry,
            commands: command_rx,
            events: event_tx,
            outbox: Vec::new(),
            last_target: None,
            stopping: false,
            config,
        };
        Ok((peer, handle, PeerEvents::new(event_rx)))
    }

    /// The configuration in use.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Status of the connection to `endpoint`, if there is one.
    pub fn status(&self, endpoint: SocketAddr) -> Option<ConnectionStatus> {
        self.connections.get(&endpoint).map(Connection::status)
    }

    /// Counters of the connection to `endpoint`.
    pub fn stats(&self, endpoint: SocketAddr) -> Option<ConnectionStats> {
        self.connections.get(&endpoint).map(Connection::stats)
    }

    /// Connections currently held (any status but `Disconnected`).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether shutdown completed; the driver stops once this is true.
    pub fn is_stopped(&self) -> bool {
        self.stopping && self.connections.is_empty()
    }

    /// Run one tick against `socket` with the clock sampled at `now`.
    pub fn heartbeat<S: DatagramSocket>(&mut self, now: Instant, socket: &mut S) {
        self.drain_socket(now, socket);
        self.drain_commands(now);
        self.tick_connections(now, socket);
        self.flush_outbox(socket);
        self.remove_finished();
    }

    fn drain_socket<S: DatagramSocket>(&mut self, now: Instant, socket: &mut S) {
        loop {
            match socket.try_recv(&mut self.recv_buf) {
                Ok(Some((len, from))) => {
                    let datagram = Bytes::copy_from_slice(&self.recv_buf[..len]);
                    self.handle_datagram(from, datagram, now);
                }
                Ok(None) => break,
                Err(error) if is_forcible_close(&error) => {
                    let target = self.last_target.take();
                    if let Some(connection) = target.and_then(|t| self.connections.get_mut(&t)) {
                        connection.on_forcible_close();
                    }
                }
                Err(error) => {
                    warn!(error = %error, "socket receive failed");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, datagram: Bytes, now: Instant) {
        trace!(peer = %from, len = datagram.len(), "datagram received");
        if let Some(connection) = self.connections.get_mut(&from) {
            connection.record_received(datagram.len(), now);
        }
        for unit in UnitReader::new(datagram) {
            match unit {
                Ok(unit) => self.handle_unit(from, unit, now),
                Err(error) => self.report(from, error.into()),
            }
        }
    }

    fn handle_unit(&mut self, from: SocketAddr, unit: Unit, now: Instant) {
        if let Unit::System(SystemMessage::Unconnected { subtype, payload }) = unit {
            self.emit(PeerEvent::Unconnected {
                endpoint: from,
                subtype,
                payload,
            });
            return;
        }

        let Some(connection) = self.connections.get_mut(&from) else {
            self.handle_stranger(from, unit, now);
            return;
        };
        match connection.handle_unit(unit, now) {
            Ok(()) => {}
            Err(error) if error.is_fatal() => connection.fail(error),
            Err(error) => self.report(from, error),
        }
    }

    /// Traffic from an endpoint without a connection.
    fn handle_stranger(&mut self, from: SocketAddr, unit: Unit, now: Instant) {
        match unit {
            Unit::System(SystemMessage::Connect { epoch, hail }) => {
                if let Some(reason) = self.refusal() {
                    info!(peer = %from, reason, "rejecting connection");
                    self.outbox.push((
                        from,
                        Unit::System(SystemMessage::ConnectionRejected {
                            reason: reason.into(),
                        }),
                    ));
                    return;
                }
                info!(peer = %from, epoch, "accepting connection");
                let mut connection =
                    Connection::accept(from, epoch, hail, Arc::clone(&self.config), now);
                connection.record_received(0, now);
                self.registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(from, Arc::clone(connection.credits()));
                self.connections.insert(from, connection);
            }
            // farewell from a connection we already dropped
            Unit::System(SystemMessage::Disconnect { .. }) => {}
            _ => self.report(from, TransportError::UnknownEndpoint),
        }
    }

    fn refusal(&self) -> Option<&'static str> {
        if self.stopping {
            Some("shutting down")
        } else if !self.config.accept_incoming {
            Some("not accepting connections")
        } else if self.connections.len() >= self.config.max_connections {
            Some("server full")
        } else {
            None
        }
    }

    fn drain_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Connect {
                    endpoint,
                    hail,
                    credits,
                } => self.connect(endpoint, hail, credits, now),
                Command::Send {
                    endpoint,
                    channel,
                    message,
                    credits,
                } => match self.connections.get_mut(&endpoint) {
                    Some(connection)
                        if connection.accepts_submissions()
                            && Arc::ptr_eq(connection.credits(), &credits) =>
                    {
                        connection.submit(channel, message);
                    }
                    _ => {
                        debug!(peer = %endpoint, channel = %channel, "send for closed connection dropped");
                        credits.release(channel, 1);
                    }
                },
                Command::Disconnect { endpoint, reason } => {
                    if let Some(connection) = self.connections.get_mut(&endpoint) {
                        connection.disconnect(&reason, now);
                    }
                }
                Command::Approve { endpoint } => {
                    let approved = self
                        .connections
                        .get_mut(&endpoint)
                        .is_some_and(Connection::approve);
                    if !approved {
                        debug!(peer = %endpoint, "no connection awaiting approval");
                    }
                }
                Command::Deny { endpoint, reason } => {
                    let denied = self
                        .connections
                        .get_mut(&endpoint)
                        .is_some_and(|connection| connection.deny(&reason));
                    if !denied {
                        debug!(peer = %endpoint, "no connection awaiting approval");
                    }
                }
                Command::Unconnected {
                    endpoint,
                    subtype,
                    payload,
                } => self.outbox.push((
                    endpoint,
                    Unit::System(SystemMessage::Unconnected { subtype, payload }),
                )),
                Command::Shutdown { reason } => {
                    info!(reason = %reason, connections = self.connections.len(), "shutting down");
                    self.stopping = true;
                    for connection in self.connections.values_mut() {
                        connection.disconnect(&reason, now);
                    }
                }
            }
        }
    }

    fn connect(
        &mut self,
        endpoint: SocketAddr,
        hail: Bytes,
        credits: Arc<ChannelCredits>,
        now: Instant,
    ) {
        if let Some(existing) = self.connections.get(&endpoint)
            && existing.accepts_submissions()
        {
            debug!(peer = %endpoint, status = %existing.status(), "already connected");
            return;
        }
        let replacing = self.connections.contains_key(&endpoint);
        if !replacing && self.connections.len() >= self.config.max_connections {
            warn!(peer = %endpoint, "connection limit reached");
            self.unregister(endpoint, &credits);
            self.emit(PeerEvent::ConnectionFailed {
                endpoint,
                reason: "too many connections".into(),
            });
            return;
        }

        let epoch = rand::random::<u8>();
        info!(peer = %endpoint, epoch, "connecting");
        let mut connection =
            Connection::initiate(endpoint, epoch, hail, Arc::clone(&self.config), now)
                .with_credits(credits);
        for event in connection.drain_events() {
            self.emit(PeerEvent::from_connection(endpoint, event));
        }
        self.connections.insert(endpoint, connection);
    }

    fn tick_connections<S: DatagramSocket>(&mut self, now: Instant, socket: &mut S) {
        let mtu = self.config.mtu;
        let mut units = Vec::new();

        for (&endpoint, connection) in self.connections.iter_mut() {
            units.clear();
            connection.heartbeat(now, &mut units);

            for datagram in pack(&units, mtu, &mut self.pool) {
                self.last_target = Some(endpoint);
                match socket.try_send(endpoint, &datagram) {
                    Ok(()) => connection.record_sent(datagram.len()),
                    Err(error) if is_forcible_close(&error) => connection.on_forcible_close(),
                    Err(error) => debug!(peer = %endpoint, error = %error, "datagram not sent"),
                }
                self.pool.release(datagram);
            }

            for event in connection.drain_events() {
                if self
                    .events
                    .send(PeerEvent::from_connection(endpoint, event))
                    .is_err()
                {
                    trace!("event queue closed");
                }
            }
        }
    }

    fn flush_outbox<S: DatagramSocket>(&mut self, socket: &mut S) {
        for (endpoint, unit) in std::mem::take(&mut self.outbox) {
            for datagram in pack(std::slice::from_ref(&unit), self.config.mtu, &mut self.pool) {
                self.last_target = Some(endpoint);
                if let Err(error) = socket.try_send(endpoint, &datagram) {
                    debug!(peer = %endpoint, error = %error, "connectionless datagram not sent");
                }
                self.pool.release(datagram);
            }
        }
    }

    fn remove_finished(&mut self) {
        let finished: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.is_finished())
            .map(|(&endpoint, _)| endpoint)
            .collect();
        for endpoint in finished {
            if let Some(connection) = self.connections.remove(&endpoint) {
                debug!(peer = %endpoint, "connection removed");
                self.unregister(endpoint, connection.credits());
            }
        }
    }

    /// Drop the registry entry of `endpoint` if it still refers to `credits`.
    fn unregister(&self, endpoint: SocketAddr, credits: &Arc<ChannelCredits>) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry
            .get(&endpoint)
            .is_some_and(|current| Arc::ptr_eq(current, credits))
        {
            registry.remove(&endpoint);
        }
    }

    fn report(&self, endpoint: SocketAddr, error: TransportError) {
        debug!(peer = %endpoint, error = %error, "input dropped");
        if self.config.diagnostics {
            self.emit(PeerEvent::Diagnostic {
                endpoint,
                message: error.to_string(),
            });
        }
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            trace!("event queue closed");
        }
    }
}

/// Pack `units` into datagrams built from pooled buffers.
fn pack(units: &[Unit], mtu: usize, pool: &mut BufferPool) -> Vec<BytesMut> {
    let mut packer = DatagramPacker::new(mtu);
    for unit in units {
        packer.push(unit, || pool.acquire());
    }
    packer.finish()
}
