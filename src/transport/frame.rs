//! Datagram unit encoding and decoding.
//!
//! A datagram carries one or more units back to back, each starting with a
//! one-byte category tag. All integers are little-endian.
//!
//! ```text
//! User          | 0x01 | epoch u8 | channel u8 | seq u16 | len u16 | payload |
//! UserFragment  | 0x02 | epoch u8 | channel u8 | group u16 | index u16 | count u16 | len u16 | payload |
//! Ack           | 0x03 | epoch u8 | channel u8 | base u16 | bitfield len u8 | bitfield |
//! System        | 0x07 | subtype u8 | len u16 | payload |
//! ```
//!
//! The epoch names the pipeline generation of the connection. Connect and
//! ConnectResponse carry it as the first payload byte, ahead of the hail.
//!
//! A malformed unit ends decoding of its datagram; units decoded before it
//! are kept.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::channel::{AckRecord, ChannelId, Fragment};
use crate::core::Seq;
use crate::core::constants::{
    ACK_HEADER_SIZE, FRAGMENT_HEADER_SIZE, HANDSHAKE_EPOCH_SIZE, SYSTEM_CONNECT, SYSTEM_CONNECT_RESPONSE,
    SYSTEM_CONNECTION_ESTABLISHED, SYSTEM_CONNECTION_REJECTED, SYSTEM_DISCONNECT,
    SYSTEM_DISCOVERY, SYSTEM_DISCOVERY_RESPONSE, SYSTEM_HEADER_SIZE, SYSTEM_NAT_INTRODUCTION,
    SYSTEM_PING, SYSTEM_PONG, SYSTEM_UNCONNECTED_DATA, UNIT_ACK, UNIT_SYSTEM, UNIT_USER,
    UNIT_USER_FRAGMENT, USER_HEADER_SIZE,
};

/// Errors that can occur while decoding a unit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes left for the unit.
    #[error("unit too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown category tag.
    #[error("unknown unit tag: 0x{0:02x}")]
    UnknownTag(u8),

    /// Unknown system message subtype.
    #[error("unknown system message subtype: {0}")]
    UnknownSystemType(u8),

    /// Channel byte names a reserved or out-of-range id.
    #[error("invalid channel id: {0}")]
    InvalidChannel(u8),

    /// A fixed-size system payload has the wrong length.
    #[error("system message {subtype} has invalid length {len}")]
    InvalidSystemLength {
        /// Subtype of the message.
        subtype: u8,
        /// Length carried on the wire.
        len: usize,
    },
}

/// Library control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    /// Connection request.
    Connect {
        /// Pipeline epoch the initiator offers.
        epoch: u8,
        /// Application hail payload.
        hail: Bytes,
    },
    /// Response to a connection request.
    ConnectResponse {
        /// Epoch adopted by the acceptor.
        epoch: u8,
        /// Application hail payload of the acceptor.
        hail: Bytes,
    },
    /// Final handshake leg sent by the initiator.
    ConnectionEstablished,
    /// Best-effort disconnect notice.
    Disconnect {
        /// Human-readable reason.
        reason: String,
    },
    /// Connection request refused.
    ConnectionRejected {
        /// Human-readable reason.
        reason: String,
    },
    /// Round-trip probe.
    Ping(u8),
    /// Echo of a probe.
    Pong(u8),
    /// Discovery, NAT-introduction or unconnected application data, passed
    /// through untouched.
    Unconnected {
        /// System subtype.
        subtype: u8,
        /// Raw payload.
        payload: Bytes,
    },
}

impl SystemMessage {
    /// Wire subtype byte.
    pub fn subtype(&self) -> u8 {
        match self {
            SystemMessage::Connect { .. } => SYSTEM_CONNECT,
            SystemMessage::ConnectResponse { .. } => SYSTEM_CONNECT_RESPONSE,
            SystemMessage::ConnectionEstablished => SYSTEM_CONNECTION_ESTABLISHED,
            SystemMessage::Disconnect { .. } => SYSTEM_DISCONNECT,
            SystemMessage::ConnectionRejected { .. } => SYSTEM_CONNECTION_REJECTED,
            SystemMessage::Ping(_) => SYSTEM_PING,
            SystemMessage::Pong(_) => SYSTEM_PONG,
            SystemMessage::Unconnected { subtype, .. } => *subtype,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            SystemMessage::Connect { hail, .. } | SystemMessage::ConnectResponse { hail, .. } => {
                HANDSHAKE_EPOCH_SIZE + hail.len()
            }
            SystemMessage::ConnectionEstablished => 0,
            SystemMessage::Disconnect { reason } | SystemMessage::ConnectionRejected { reason } => {
                reason.len()
            }
            SystemMessage::Ping(_) | SystemMessage::Pong(_) => 1,
            SystemMessage::Unconnected { payload, .. } => payload.len(),
        }
    }

    fn put_payload(&self, buf: &mut impl BufMut) {
        match self {
            SystemMessage::Connect { epoch, hail }
            | SystemMessage::ConnectResponse { epoch, hail } => {
                buf.put_u8(*epoch);
                buf.put_slice(hail)
            }
            SystemMessage::ConnectionEstablished => {}
            SystemMessage::Disconnect { reason } | SystemMessage::ConnectionRejected { reason } => {
                buf.put_slice(reason.as_bytes())
            }
            SystemMessage::Ping(number) | SystemMessage::Pong(number) => buf.put_u8(*number),
            SystemMessage::Unconnected { payload, .. } => buf.put_slice(payload),
        }
    }

    fn parse(subtype: u8, mut payload: Bytes) -> Result<Self, FrameError> {
        let invalid_length = |payload: &Bytes| FrameError::InvalidSystemLength {
            subtype,
            len: payload.len(),
        };
        let fixed_byte = |payload: &Bytes| match payload.as_ref() {
            [number] => Ok(*number),
            _ => Err(invalid_length(payload)),
        };
        let epoch = |payload: &mut Bytes| {
            if payload.is_empty() {
                return Err(invalid_length(&*payload));
            }
            Ok(payload.get_u8())
        };
        let message = match subtype {
            SYSTEM_CONNECT => SystemMessage::Connect {
                epoch: epoch(&mut payload)?,
                hail: payload,
            },
            SYSTEM_CONNECT_RESPONSE => SystemMessage::ConnectResponse {
                epoch: epoch(&mut payload)?,
                hail: payload,
            },
            SYSTEM_CONNECTION_ESTABLISHED => SystemMessage::ConnectionEstablished,
            SYSTEM_DISCONNECT => SystemMessage::Disconnect {
                reason: String::from_utf8_lossy(&payload).into_owned(),
            },
            SYSTEM_CONNECTION_REJECTED => SystemMessage::ConnectionRejected {
                reason: String::from_utf8_lossy(&payload).into_owned(),
            },
            SYSTEM_PING => SystemMessage::Ping(fixed_byte(&payload)?),
            SYSTEM_PONG => SystemMessage::Pong(fixed_byte(&payload)?),
            SYSTEM_DISCOVERY
            | SYSTEM_DISCOVERY_RESPONSE
            | SYSTEM_NAT_INTRODUCTION
            | SYSTEM_UNCONNECTED_DATA => SystemMessage::Unconnected { subtype, payload },
            other => return Err(FrameError::UnknownSystemType(other)),
        };
        Ok(message)
    }
}

/// One unit of a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A complete application message.
    User {
        /// Pipeline epoch of the sender.
        epoch: u8,
        /// Channel of the message.
        channel: ChannelId,
        /// Channel sequence number.
        seq: Seq,
        /// Application payload.
        payload: Bytes,
    },
    /// One fragment of an application message.
    Fragment {
        /// Pipeline epoch of the sender.
        epoch: u8,
        /// The fragment itself.
        fragment: Fragment,
    },
    /// Acknowledgment for a reliable channel.
    Ack {
        /// Pipeline epoch of the sender.
        epoch: u8,
        /// Acknowledged sequence numbers.
        record: AckRecord,
    },
    /// Control message.
    System(SystemMessage),
}

impl Unit {
    /// Bytes this unit occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Unit::User { payload, .. } => USER_HEADER_SIZE + payload.len(),
            Unit::Fragment { fragment, .. } => FRAGMENT_HEADER_SIZE + fragment.payload.len(),
            Unit::Ack { record, .. } => ACK_HEADER_SIZE + record.bits.len(),
            Unit::System(message) => SYSTEM_HEADER_SIZE + message.payload_len(),
        }
    }

    /// Append the wire form to `buf`.
    ///
    /// Payload sizes are bounded by the MTU, so every length fits its field.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Unit::User {
                epoch,
                channel,
                seq,
                payload,
            } => {
                buf.put_u8(UNIT_USER);
                buf.put_u8(*epoch);
                buf.put_u8(channel.get());
                buf.put_u16_le(seq.get());
                buf.put_u16_le(payload.len() as u16);
                buf.put_slice(payload);
            }
            Unit::Fragment { epoch, fragment } => {
                buf.put_u8(UNIT_USER_FRAGMENT);
                buf.put_u8(*epoch);
                buf.put_u8(fragment.channel.get());
                buf.put_u16_le(fragment.group.get());
                buf.put_u16_le(fragment.index);
                buf.put_u16_le(fragment.count);
                buf.put_u16_le(fragment.payload.len() as u16);
                buf.put_slice(&fragment.payload);
            }
            Unit::Ack { epoch, record } => {
                buf.put_u8(UNIT_ACK);
                buf.put_u8(*epoch);
                buf.put_u8(record.channel.get());
                buf.put_u16_le(record.base.get());
                buf.put_u8(record.bits.len() as u8);
                buf.put_slice(&record.bits);
            }
            Unit::System(message) => {
                buf.put_u8(UNIT_SYSTEM);
                buf.put_u8(message.subtype());
                buf.put_u16_le(message.payload_len() as u16);
                message.put_payload(buf);
            }
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Iterator over the units of one datagram.
///
/// Yields `Err` once for a malformed unit and then stops. Payloads are
/// zero-copy slices of the datagram.
#[derive(Debug)]
pub struct UnitReader {
    data: Bytes,
    failed: bool,
}

impl UnitReader {
    /// Start reading `datagram`.
    pub fn new(datagram: Bytes) -> Self {
        Self {
            data: datagram,
            failed: false,
        }
    }

    fn need(&self, expected: usize) -> Result<(), FrameError> {
        if self.data.remaining() < expected {
            return Err(FrameError::TooShort {
                expected,
                actual: self.data.remaining(),
            });
        }
        Ok(())
    }

    fn channel(raw: u8) -> Result<ChannelId, FrameError> {
        ChannelId::new(raw).map_err(|_| FrameError::InvalidChannel(raw))
    }

    fn take(&mut self, len: usize) -> Result<Bytes, FrameError> {
        self.need(len)?;
        Ok(self.data.split_to(len))
    }

    fn read_unit(&mut self) -> Result<Unit, FrameError> {
        let tag = self.data.get_u8();
        match tag {
            UNIT_USER => {
                self.need(USER_HEADER_SIZE - 1)?;
                let epoch = self.data.get_u8();
                let channel = Self::channel(self.data.get_u8())?;
                let seq = Seq::new(self.data.get_u16_le());
                let len = self.data.get_u16_le() as usize;
                let payload = self.take(len)?;
                Ok(Unit::User {
                    epoch,
                    channel,
                    seq,
                    payload,
                })
            }
            UNIT_USER_FRAGMENT => {
                self.need(FRAGMENT_HEADER_SIZE - 1)?;
                let epoch = self.data.get_u8();
                let channel = Self::channel(self.data.get_u8())?;
                let group = Seq::new(self.data.get_u16_le());
                let index = self.data.get_u16_le();
                let count = self.data.get_u16_le();
                let len = self.data.get_u16_le() as usize;
                let payload = self.take(len)?;
                Ok(Unit::Fragment {
                    epoch,
                    fragment: Fragment {
                        channel,
                        group,
                        index,
                        count,
                        payload,
                    },
                })
            }
            UNIT_ACK => {
                self.need(ACK_HEADER_SIZE - 1)?;
                let epoch = self.data.get_u8();
                let channel = Self::channel(self.data.get_u8())?;
                let base = Seq::new(self.data.get_u16_le());
                let len = self.data.get_u8() as usize;
                let bits = self.take(len)?.to_vec();
                Ok(Unit::Ack {
                    epoch,
                    record: AckRecord {
                        channel,
                        base,
                        bits,
                    },
                })
            }
            UNIT_SYSTEM => {
                self.need(SYSTEM_HEADER_SIZE - 1)?;
                let subtype = self.data.get_u8();
                let len = self.data.get_u16_le() as usize;
                let payload = self.take(len)?;
                Ok(Unit::System(SystemMessage::parse(subtype, payload)?))
            }
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

impl Iterator for UnitReader {
    type Item = Result<Unit, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.data.has_remaining() {
            return None;
        }
        let unit = self.read_unit();
        if unit.is_err() {
            self.failed = true;
        }
        Some(unit)
    }
}

/// Packs units into datagrams no larger than the MTU.
///
/// A unit never straddles two datagrams. Buffers are supplied by the caller
/// (normally from a [`BufferPool`](super::BufferPool)).
#[derive(Debug)]
pub struct DatagramPacker {
    mtu: usize,
    current: Option<BytesMut>,
    finished: Vec<BytesMut>,
}

impl DatagramPacker {
    /// Create a packer for datagrams of at most `mtu` bytes.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            current: None,
            finished: Vec::new(),
        }
    }

    /// Append `unit`, starting a new datagram from `fresh` when it does not fit.
    pub fn push(&mut self, unit: &Unit, mut fresh: impl FnMut() -> BytesMut) {
        let len = unit.encoded_len();
        let full = self
            .current
            .as_ref()
            .is_some_and(|current| !current.is_empty() && current.len() + len > self.mtu);
        if full && let Some(done) = self.current.take() {
            self.finished.push(done);
        }
        let current = self.current.get_or_insert_with(&mut fresh);
        unit.encode(current);
    }

    /// Whether nothing has been packed.
    pub fn is_empty(&self) -> bool {
        self.finished.is_empty() && self.current.as_ref().is_none_or(|c| c.is_empty())
    }

    /// Finish packing and return the datagrams.
    pub fn finish(mut self) -> Vec<BytesMut> {
        if let Some(current) = self.current.take()
            && !current.is_empty()
        {
            self.finished.push(current);
        }
        self.finished
    }
}
