//! In-memory lossy network for driving peers deterministically.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use netchannel::prelude::*;
use netchannel::transport::{Unit, UnitReader};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Decides whether a datagram from `from` to `to` is dropped.
pub type Filter = Box<dyn FnMut(SocketAddr, SocketAddr, &[Unit]) -> bool + Send>;

/// Box a drop decision for [`NetState::filter`].
pub fn filter(
    decide: impl FnMut(SocketAddr, SocketAddr, &[Unit]) -> bool + Send + 'static,
) -> Option<Filter> {
    Some(Box::new(decide))
}

/// Shared state of the simulated network.
pub struct NetState {
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    rng: StdRng,
    pub loss: f64,
    pub duplicate: f64,
    pub reorder: bool,
    pub filter: Option<Filter>,
    /// Every datagram handed to the network, with the time it was sent.
    pub log: Vec<(Instant, SocketAddr, SocketAddr, Vec<Unit>)>,
    pub now: Instant,
}

impl NetState {
    fn deliver(&mut self, from: SocketAddr, to: SocketAddr, datagram: Vec<u8>) {
        let Some(inbox) = self.inboxes.get_mut(&to) else {
            return;
        };
        let position = if self.reorder && !inbox.is_empty() {
            self.rng.gen_range(0..=inbox.len())
        } else {
            inbox.len()
        };
        inbox.insert(position, (from, datagram));
    }

    /// Put a datagram straight into `to`'s inbox.
    pub fn inject(&mut self, from: SocketAddr, to: SocketAddr, datagram: Vec<u8>) {
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            inbox.push_back((from, datagram));
        }
    }
}

/// Handle to the simulated network.
#[derive(Clone)]
pub struct Network(Arc<Mutex<NetState>>);

impl Network {
    pub fn new(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(NetState {
            inboxes: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            loss: 0.0,
            duplicate: 0.0,
            reorder: false,
            filter: None,
            log: Vec::new(),
            now: Instant::now(),
        })))
    }

    pub fn socket(&self, addr: SocketAddr) -> SimSocket {
        self.state().inboxes.insert(addr, VecDeque::new());
        SimSocket {
            addr,
            net: self.clone(),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.0.lock().unwrap()
    }
}

/// One endpoint of the simulated network.
pub struct SimSocket {
    addr: SocketAddr,
    net: Network,
}

impl DatagramSocket for SimSocket {
    fn try_send(&mut self, target: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let mut net = self.net.state();
        let units: Vec<Unit> = UnitReader::new(Bytes::copy_from_slice(datagram))
            .map(|unit| unit.expect("peers only send well-formed units"))
            .collect();
        let now = net.now;
        net.log.push((now, self.addr, target, units.clone()));

        if let Some(filter) = net.filter.as_mut()
            && filter(self.addr, target, &units)
        {
            return Ok(());
        }
        let loss = net.loss;
        if loss > 0.0 && net.rng.gen_bool(loss) {
            return Ok(());
        }
        net.deliver(self.addr, target, datagram.to_vec());
        let duplicate = net.duplicate;
        if duplicate > 0.0 && net.rng.gen_bool(duplicate) {
            net.deliver(self.addr, target, datagram.to_vec());
        }
        Ok(())
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut net = self.net.state();
        let Some((from, datagram)) = net
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(Some((datagram.len(), from)))
    }
}

/// A peer with its handle, event queue and socket.
pub struct Node {
    pub addr: SocketAddr,
    pub peer: Peer,
    pub handle: PeerHandle,
    pub events: PeerEvents,
    pub socket: SimSocket,
    /// Every event seen so far.
    pub seen: Vec<PeerEvent>,
}

impl Node {
    pub fn new(net: &Network, addr: &str, config: PeerConfig) -> Self {
        let addr: SocketAddr = addr.parse().unwrap();
        let (peer, handle, events) = Peer::new(config).unwrap();
        Self {
            addr,
            peer,
            handle,
            events,
            socket: net.socket(addr),
            seen: Vec::new(),
        }
    }

    fn tick(&mut self, now: Instant) {
        self.peer.heartbeat(now, &mut self.socket);
        self.seen.extend(self.events.drain());
    }

    /// Payloads delivered on `channel`, in delivery order.
    pub fn received(&self, channel: ChannelId) -> Vec<Bytes> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                PeerEvent::Data {
                    channel: c,
                    payload,
                    ..
                } if *c == channel => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Status changes in order.
    pub fn statuses(&self) -> Vec<(ConnectionStatus, Option<String>)> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                PeerEvent::StatusChanged { status, reason, .. } => Some((*status, reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&PeerEvent) -> bool) -> usize {
        self.seen.iter().filter(|event| matches(event)).count()
    }
}

/// Two peers on one network, ticked together.
pub struct Pair {
    pub net: Network,
    pub a: Node,
    pub b: Node,
    pub now: Instant,
    pub step: Duration,
}

impl Pair {
    pub fn new(seed: u64, a: PeerConfig, b: PeerConfig) -> Self {
        let net = Network::new(seed);
        let now = net.state().now;
        Self {
            a: Node::new(&net, "10.0.0.1:4000", a),
            b: Node::new(&net, "10.0.0.2:4000", b),
            net,
            now,
            step: Duration::from_millis(10),
        }
    }

    /// Advance the clock one step and tick both peers.
    pub fn tick(&mut self) {
        self.now += self.step;
        self.net.state().now = self.now;
        self.a.tick(self.now);
        self.b.tick(self.now);
    }

    pub fn run(&mut self, duration: Duration) {
        let steps = duration.as_millis() / self.step.as_millis();
        for _ in 0..steps {
            self.tick();
        }
    }

    /// Tick until `done` holds, at most `limit` of simulated time.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Pair) -> bool) -> bool {
        let deadline = self.now + limit;
        while self.now < deadline {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    /// Connect `a` to `b` and wait until both sides are connected.
    pub fn connect(&mut self) {
        let b = self.b.addr;
        self.a.handle.connect(b, "hail").unwrap();
        let a = self.a.addr;
        let connected = self.run_until(Duration::from_secs(10), |pair| {
            pair.a.peer.status(b) == Some(ConnectionStatus::Connected)
                && pair.b.peer.status(a) == Some(ConnectionStatus::Connected)
        });
        assert!(connected, "handshake did not complete");
    }

    /// Send from `a` to `b`, ticking through backpressure.
    pub fn send_blocking(&mut self, channel: ChannelId, payload: Bytes) {
        let b = self.b.addr;
        for _ in 0..10_000 {
            match self.a.handle.send(b, channel, payload.clone()) {
                Ok(()) => return,
                Err(SendError::Backpressure(_)) => self.tick(),
                Err(other) => panic!("send failed: {other}"),
            }
        }
        panic!("backpressure never cleared");
    }
}

/// Configuration for tests: small MTU, patient retries, quiet pings,
/// incoming connections accepted.
pub fn test_config() -> PeerConfig {
    PeerConfig::builder()
        .mtu(256)
        .resend_delay(Duration::from_millis(100), Duration::from_secs(1))
        .max_resends(50)
        .handshake(Duration::from_millis(100), 20)
        .ping_interval(Duration::from_secs(1))
        .connection_timeout(Duration::from_secs(30))
        .reassembly_timeout(Duration::from_millis(500))
        .accept_incoming(true)
        .build()
        .unwrap()
}

/// Whether the units contain an acknowledgment.
pub fn has_ack(units: &[Unit]) -> bool {
    units.iter().any(|unit| matches!(unit, Unit::Ack { .. }))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
