//! Notifications surfaced to the application.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::channel::ChannelId;
use crate::transport::{ConnectionEvent, ConnectionStatus};

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A connection changed status.
    StatusChanged {
        /// Remote endpoint.
        endpoint: SocketAddr,
        /// New status.
        status: ConnectionStatus,
        /// Why, when known.
        reason: Option<String>,
        /// Hail of the remote, on `Connected`.
        remote_hail: Option<Bytes>,
    },

    /// A connect attempt failed; a `Disconnected` status change follows.
    ConnectionFailed {
        /// Remote endpoint.
        endpoint: SocketAddr,
        /// Why.
        reason: String,
    },

    /// An incoming connection waits for `PeerHandle::approve` or
    /// `PeerHandle::deny` (only with `require_approval`).
    ConnectionApproval {
        /// Initiator.
        endpoint: SocketAddr,
        /// Hail sent with the request.
        hail: Bytes,
    },

    /// A message was delivered.
    Data {
        /// Sender.
        endpoint: SocketAddr,
        /// Channel it arrived on.
        channel: ChannelId,
        /// Payload.
        payload: Bytes,
    },

    /// A reliable message sent with a receipt tag was acknowledged.
    Receipt {
        /// Remote endpoint.
        endpoint: SocketAddr,
        /// Channel it was sent on.
        channel: ChannelId,
        /// The tag given to `send_with_receipt`.
        tag: Bytes,
    },

    /// A reliable message exhausted its resends and was dropped.
    ReceiptFailed {
        /// Remote endpoint.
        endpoint: SocketAddr,
        /// Channel it was sent on.
        channel: ChannelId,
        /// The tag given to `send_with_receipt`, if any.
        tag: Option<Bytes>,
    },

    /// Connectionless discovery, NAT-introduction or application traffic,
    /// untouched.
    Unconnected {
        /// Sender.
        endpoint: SocketAddr,
        /// System subtype (50 to 53).
        subtype: u8,
        /// Raw payload.
        payload: Bytes,
    },

    /// Input was dropped (only with diagnostics enabled).
    Diagnostic {
        /// Endpoint involved.
        endpoint: SocketAddr,
        /// What happened.
        message: String,
    },
}

impl PeerEvent {
    /// Tag a connection event with its endpoint.
    pub(crate) fn from_connection(endpoint: SocketAddr, event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::StatusChanged {
                status,
                reason,
                remote_hail,
            } => PeerEvent::StatusChanged {
                endpoint,
                status,
                reason,
                remote_hail,
            },
            ConnectionEvent::ConnectionFailed { reason } => {
                PeerEvent::ConnectionFailed { endpoint, reason }
            }
            ConnectionEvent::Data { channel, payload } => PeerEvent::Data {
                endpoint,
                channel,
                payload,
            },
            ConnectionEvent::Receipt { channel, tag } => PeerEvent::Receipt {
                endpoint,
                channel,
                tag,
            },
            ConnectionEvent::ReceiptFailed { channel, tag } => PeerEvent::ReceiptFailed {
                endpoint,
                channel,
                tag,
            },
            ConnectionEvent::ApprovalRequested { hail } => {
                PeerEvent::ConnectionApproval { endpoint, hail }
            }
        }
    }

    /// The endpoint this event concerns.
    pub fn endpoint(&self) -> SocketAddr {
        match self {
            PeerEvent::StatusChanged { endpoint, .. }
            | PeerEvent::ConnectionFailed { endpoint, .. }
            | PeerEvent::ConnectionApproval { endpoint, .. }
            | PeerEvent::Data { endpoint, .. }
            | PeerEvent::Receipt { endpoint, .. }
            | PeerEvent::ReceiptFailed { endpoint, .. }
            | PeerEvent::Unconnected { endpoint, .. }
            | PeerEvent::Diagnostic { endpoint, .. } => *endpoint,
        }
    }
}
