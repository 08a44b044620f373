//! Thread-safe application side of a [`Peer`](super::Peer).
//!
//! A [`PeerHandle`] turns application calls into commands the heartbeat
//! drains on its next tick; [`PeerEvents`] receives what the heartbeat
//! produced. Neither side ever waits for the other.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{ChannelId, OutgoingMessage};
use crate::core::SendError;
use crate::core::constants::{
    SYSTEM_DISCOVERY, SYSTEM_DISCOVERY_RESPONSE, SYSTEM_NAT_INTRODUCTION, SYSTEM_UNCONNECTED_DATA,
};
use crate::transport::ChannelCredits;

use super::config::PeerConfig;
use super::event::PeerEvent;

/// Credit tables of live connections, keyed by endpoint.
pub(crate) type Registry = Arc<RwLock<FxHashMap<SocketAddr, Arc<ChannelCredits>>>>;

/// Work handed from application threads to the heartbeat.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        endpoint: SocketAddr,
        hail: Bytes,
        credits: Arc<ChannelCredits>,
    },
    Send {
        endpoint: SocketAddr,
        channel: ChannelId,
        message: OutgoingMessage,
        /// Table the credit was taken from.
        credits: Arc<ChannelCredits>,
    },
    Disconnect {
        endpoint: SocketAddr,
        reason: String,
    },
    Approve {
        endpoint: SocketAddr,
    },
    Deny {
        endpoint: SocketAddr,
        reason: String,
    },
    Unconnected {
        endpoint: SocketAddr,
        subtype: u8,
        payload: Bytes,
    },
    Shutdown {
        reason: String,
    },
}

/// Cloneable, thread-safe handle for submitting work to a peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    config: Arc<PeerConfig>,
    commands: mpsc::UnboundedSender<Command>,
    registry: Registry,
    shutdown: Arc<AtomicBool>,
}

impl PeerHandle {
    pub(crate) fn new(
        config: Arc<PeerConfig>,
        commands: mpsc::UnboundedSender<Command>,
        registry: Registry,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            commands,
            registry,
            shutdown,
        }
    }

    /// Start connecting to `endpoint`, offering `hail`.
    ///
    /// Messages sent to the endpoint from now on are queued until the
    /// handshake completes. Connecting to an endpoint that already has a
    /// live connection is a no-op.
    pub fn connect(&self, endpoint: SocketAddr, hail: impl Into<Bytes>) -> Result<(), SendError> {
        self.ensure_running()?;
        let hail = hail.into();
        let max = self.config.max_hail_size();
        if hail.len() > max {
            return Err(SendError::MessageTooLarge {
                size: hail.len(),
                max,
            });
        }
        let credits = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint)
            .or_insert_with(|| Arc::new(ChannelCredits::new(self.config.max_outstanding)))
            .clone();
        self.dispatch(Command::Connect {
            endpoint,
            hail,
            credits,
        })
    }

    /// Send `payload` to `endpoint` on `channel`.
    ///
    /// Fails with [`SendError::Backpressure`] when the reliable channel has
    /// `max_outstanding` messages in flight.
    pub fn send(
        &self,
        endpoint: SocketAddr,
        channel: ChannelId,
        payload: impl Into<Bytes>,
    ) -> Result<(), SendError> {
        self.submit(endpoint, channel, OutgoingMessage::new(payload))
    }

    /// Like [`send`](Self::send), reporting `tag` in a
    /// [`PeerEvent::Receipt`] or [`PeerEvent::ReceiptFailed`].
    ///
    /// The tag is ignored on channels without acknowledgment.
    pub fn send_with_receipt(
        &self,
        endpoint: SocketAddr,
        channel: ChannelId,
        payload: impl Into<Bytes>,
        tag: impl Into<Bytes>,
    ) -> Result<(), SendError> {
        self.submit(endpoint, channel, OutgoingMessage::with_receipt(payload, tag))
    }

    fn submit(
        &self,
        endpoint: SocketAddr,
        channel: ChannelId,
        message: OutgoingMessage,
    ) -> Result<(), SendError> {
        self.ensure_running()?;
        let size = message.payload.len();
        if size > self.config.max_message_size {
            return Err(SendError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }

        let credits = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
            .cloned()
            .ok_or(SendError::NotConnected)?;
        if !credits.try_acquire(channel) {
            debug!(peer = %endpoint, channel = %channel, "send rejected: channel at capacity");
            return Err(SendError::Backpressure(channel));
        }

        let command = Command::Send {
            endpoint,
            channel,
            message,
            credits: Arc::clone(&credits),
        };
        self.dispatch(command).inspect_err(|_| credits.release(channel, 1))
    }

    /// Close the connection to `endpoint` with a best-effort notice.
    ///
    /// Pending reliable sends are abandoned.
    pub fn disconnect(&self, endpoint: SocketAddr, reason: impl Into<String>) -> Result<(), SendError> {
        self.ensure_running()?;
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&endpoint);
        self.dispatch(Command::Disconnect {
            endpoint,
            reason: reason.into(),
        })
    }

    /// Let a connection held for approval complete its handshake.
    ///
    /// Answers a [`PeerEvent::ConnectionApproval`]; ignored when the
    /// endpoint has nothing waiting.
    pub fn approve(&self, endpoint: SocketAddr) -> Result<(), SendError> {
        self.ensure_running()?;
        self.dispatch(Command::Approve { endpoint })
    }

    /// Refuse a connection held for approval, sending `reason` to the
    /// initiator.
    pub fn deny(&self, endpoint: SocketAddr, reason: impl Into<String>) -> Result<(), SendError> {
        self.ensure_running()?;
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&endpoint);
        self.dispatch(Command::Deny {
            endpoint,
            reason: reason.into(),
        })
    }

    /// Send connectionless application data.
    ///
    /// Arrives as a [`PeerEvent::Unconnected`] with subtype
    /// [`SYSTEM_UNCONNECTED_DATA`].
    pub fn send_unconnected_data(
        &self,
        endpoint: SocketAddr,
        payload: impl Into<Bytes>,
    ) -> Result<(), SendError> {
        self.send_unconnected(endpoint, SYSTEM_UNCONNECTED_DATA, payload)
    }

    /// Send connectionless discovery, NAT-introduction or application
    /// traffic.
    pub fn send_unconnected(
        &self,
        endpoint: SocketAddr,
        subtype: u8,
        payload: impl Into<Bytes>,
    ) -> Result<(), SendError> {
        self.ensure_running()?;
        if !matches!(
            subtype,
            SYSTEM_DISCOVERY
                | SYSTEM_DISCOVERY_RESPONSE
                | SYSTEM_NAT_INTRODUCTION
                | SYSTEM_UNCONNECTED_DATA
        ) {
            return Err(SendError::InvalidSubtype(subtype));
        }
        let payload = payload.into();
        let max = self.config.max_hail_size();
        if payload.len() > max {
            return Err(SendError::MessageTooLarge {
                size: payload.len(),
                max,
            });
        }
        self.dispatch(Command::Unconnected {
            endpoint,
            subtype,
            payload,
        })
    }

    /// Disconnect every connection and stop the peer after its final tick.
    pub fn shutdown(&self, reason: impl Into<String>) -> Result<(), SendError> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dispatch(Command::Shutdown {
            reason: reason.into(),
        })
    }

    /// Whether `endpoint` has a connection accepting sends.
    pub fn is_connected(&self, endpoint: SocketAddr) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&endpoint)
    }

    /// Reliable messages in flight to `endpoint` on `channel`.
    pub fn in_flight(&self, endpoint: SocketAddr, channel: ChannelId) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
            .map_or(0, |credits| credits.in_flight(channel))
    }

    fn ensure_running(&self) -> Result<(), SendError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SendError::Shutdown);
        }
        Ok(())
    }

    fn dispatch(&self, command: Command) -> Result<(), SendError> {
        self.commands.send(command).map_err(|_| SendError::Shutdown)
    }
}

/// Receiving side of a peer's event queue.
#[derive(Debug)]
pub struct PeerEvents {
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl PeerEvents {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<PeerEvent>) -> Self {
        Self { events }
    }

    /// Next event if one is ready.
    pub fn poll(&mut self) -> Option<PeerEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event; `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    /// Take every ready event.
    pub fn drain(&mut self) -> Vec<PeerEvent> {
        std::iter::from_fn(|| self.poll()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (PeerHandle, mpsc::UnboundedReceiver<Command>) {
        let config = Arc::new(
            PeerConfig::builder()
                .mtu(256)
                .max_message_size(1000)
                .max_outstanding(2)
                .build()
                .unwrap(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(
            config,
            tx,
            Registry::default(),
            Arc::new(AtomicBool::new(false)),
        );
        (handle, rx)
    }

    fn endpoint() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[test]
    fn test_send_requires_connection() {
        let (handle, _rx) = handle();
        assert_eq!(
            handle.send(endpoint(), ChannelId::UNRELIABLE, "x"),
            Err(SendError::NotConnected)
        );
    }

    #[test]
    fn test_send_while_connecting_is_queued() {
        let (handle, mut rx) = handle();
        handle.connect(endpoint(), "hail").unwrap();
        handle
            .send(endpoint(), ChannelId::RELIABLE_UNORDERED, "x")
            .unwrap();

        assert!(matches!(rx.try_recv(), Ok(Command::Connect { .. })));
        assert!(matches!(rx.try_recv(), Ok(Command::Send { .. })));
        assert_eq!(handle.in_flight(endpoint(), ChannelId::RELIABLE_UNORDERED), 1);
    }

    #[test]
    fn test_backpressure() {
        let (handle, _rx) = handle();
        let channel = ChannelId::reliable_ordered(1).unwrap();
        handle.connect(endpoint(), "").unwrap();

        handle.send(endpoint(), channel, "a").unwrap();
        handle.send(endpoint(), channel, "b").unwrap();
        assert_eq!(
            handle.send(endpoint(), channel, "c"),
            Err(SendError::Backpressure(channel))
        );
        // unreliable traffic is never held back
        handle.send(endpoint(), ChannelId::UNRELIABLE, "d").unwrap();
    }

    #[test]
    fn test_message_size_limits() {
        let (handle, _rx) = handle();
        handle.connect(endpoint(), "").unwrap();

        let err = handle
            .send(endpoint(), ChannelId::UNRELIABLE, vec![0u8; 1001])
            .unwrap_err();
        assert_eq!(err, SendError::MessageTooLarge { size: 1001, max: 1000 });

        // one byte of the handshake payload carries the epoch
        let err = handle.connect(endpoint(), vec![0u8; 252]).unwrap_err();
        assert!(matches!(err, SendError::MessageTooLarge { max: 251, .. }));
    }

    #[test]
    fn test_unconnected_subtypes() {
        let (handle, mut rx) = handle();
        handle
            .send_unconnected(endpoint(), SYSTEM_DISCOVERY, "who is there")
            .unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Unconnected { subtype: 50, .. })
        ));
        assert_eq!(
            handle.send_unconnected(endpoint(), 1, ""),
            Err(SendError::InvalidSubtype(1))
        );

        handle.send_unconnected_data(endpoint(), "anything").unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Unconnected {
                subtype: SYSTEM_UNCONNECTED_DATA,
                ..
            })
        ));
    }

    #[test]
    fn test_approval_commands() {
        let (handle, mut rx) = handle();
        handle.connect(endpoint(), "").unwrap();
        assert!(matches!(rx.try_recv(), Ok(Command::Connect { .. })));

        handle.approve(endpoint()).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Command::Approve { .. })));

        handle.deny(endpoint(), "no").unwrap();
        assert!(!handle.is_connected(endpoint()));
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Deny { reason, .. }) if reason == "no"
        ));
    }

    #[test]
    fn test_disconnect_stops_sends() {
        let (handle, _rx) = handle();
        handle.connect(endpoint(), "").unwrap();
        assert!(handle.is_connected(endpoint()));

        handle.disconnect(endpoint(), "bye").unwrap();
        assert!(!handle.is_connected(endpoint()));
        assert_eq!(
            handle.send(endpoint(), ChannelId::UNRELIABLE, "x"),
            Err(SendError::NotConnected)
        );
    }

    #[test]
    fn test_shutdown_rejects_everything() {
        let (handle, mut rx) = handle();
        handle.shutdown("done").unwrap();
        handle.shutdown("again").unwrap();

        assert!(matches!(rx.try_recv(), Ok(Command::Shutdown { .. })));
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.connect(endpoint(), ""), Err(SendError::Shutdown));
    }

    #[test]
    fn test_closed_queue_returns_credit() {
        let (handle, rx) = handle();
        handle.connect(endpoint(), "").unwrap();
        drop(rx);

        let channel = ChannelId::RELIABLE_UNORDERED;
        assert_eq!(handle.send(endpoint(), channel, "x"), Err(SendError::Shutdown));
        assert_eq!(handle.in_flight(endpoint(), channel), 0);
    }
}
