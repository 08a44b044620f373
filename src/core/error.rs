//! Error types shared across the crate.

use thiserror::Error;

use crate::channel::ChannelId;

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// MTU below the supported minimum.
    #[error("mtu {mtu} is below the minimum of {min}")]
    MtuTooSmall {
        /// Configured MTU.
        mtu: usize,
        /// Smallest accepted MTU.
        min: usize,
    },

    /// MTU above what a UDP datagram can carry.
    #[error("mtu {mtu} exceeds the maximum of {max}")]
    MtuTooLarge {
        /// Configured MTU.
        mtu: usize,
        /// Largest accepted MTU.
        max: usize,
    },

    /// Largest message would need more fragments than a group can count.
    #[error("max message size {size} needs more than {max_fragments} fragments at this mtu")]
    TooManyFragments {
        /// Configured maximum message size.
        size: usize,
        /// Fragment count limit.
        max_fragments: usize,
    },

    /// Ack window must be a power of two in `8..=1024`.
    #[error("invalid ack window size {0}: must be a power of two between 8 and 1024")]
    InvalidWindowSize(u16),

    /// Outstanding table cannot exceed the ack window.
    #[error("max outstanding ({outstanding}) exceeds the ack window ({window})")]
    OutstandingExceedsWindow {
        /// Configured per-channel in-flight limit.
        outstanding: usize,
        /// Configured ack window.
        window: u16,
    },

    /// A duration or count that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Hail payload does not fit a single system unit.
    #[error("hail of {size} bytes exceeds the maximum of {max}")]
    HailTooLarge {
        /// Configured hail size.
        size: usize,
        /// Largest hail that fits the mtu.
        max: usize,
    },

    /// Initial resend delay above the maximum.
    #[error("initial resend delay exceeds the maximum resend delay")]
    ResendDelayOrder,
}

/// Reasons a submission is refused synchronously.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The channel's in-flight table is full; retry after acks retire entries.
    #[error("channel {0} is at capacity")]
    Backpressure(ChannelId),

    /// No connected connection to that endpoint.
    #[error("not connected")]
    NotConnected,

    /// Message larger than the configured maximum.
    #[error("message of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge {
        /// Submitted size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Channel id outside the application range.
    #[error("channel id {0} is not an application channel")]
    InvalidChannel(u8),

    /// System subtype that is not connectionless traffic.
    #[error("system subtype {0} cannot be sent unconnected")]
    InvalidSubtype(u8),

    /// The engine has shut down.
    #[error("peer shut down")]
    Shutdown,
}

/// Top-level errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Send error.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
