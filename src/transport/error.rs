//! Transport layer error types.
//!
//! Nothing here escapes the heartbeat. Malformed or unexpected input is
//! dropped (and optionally reported as a diagnostic); lifecycle failures move
//! the connection to `Disconnected`.

use std::io;

use thiserror::Error;

use crate::channel::FragmentError;

use super::frame::FrameError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Unit decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Malformed fragment.
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Traffic from an endpoint without a connection.
    #[error("no connection for endpoint")]
    UnknownEndpoint,

    /// A unit that makes no sense in the connection's current state.
    #[error("unexpected {unit} while {status}")]
    UnexpectedUnit {
        /// What arrived.
        unit: &'static str,
        /// Connection status at the time.
        status: &'static str,
    },

    /// A unit stamped with an epoch other than the connection's.
    #[error("unit from epoch {actual}, connection is at epoch {expected}")]
    StaleEpoch {
        /// Epoch the connection accepts.
        expected: u8,
        /// Epoch the unit carried.
        actual: u8,
    },

    /// No handshake response within the retry budget.
    #[error("failed to connect: no response from remote host")]
    HandshakeTimeout,

    /// Connected peer fell silent.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// Socket reported the remote port closed while connecting.
    #[error("failed to connect: remote host is not listening")]
    NotListening,

    /// Socket reported the remote port closed on a live connection.
    #[error("connection forcibly closed by remote host")]
    ForciblyClosed,

    /// The acceptor refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Check if this error should result in a silent drop (no state change).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Frame(_)
                | TransportError::Fragment(_)
                | TransportError::UnknownEndpoint
                | TransportError::UnexpectedUnit { .. }
                | TransportError::StaleEpoch { .. }
        )
    }

    /// Check if this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::HandshakeTimeout
                | TransportError::ConnectionTimeout
                | TransportError::NotListening
                | TransportError::ForciblyClosed
                | TransportError::Rejected(_)
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
