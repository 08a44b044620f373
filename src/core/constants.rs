//! Protocol constants and configuration defaults.
//!
//! Wire values in this module are fixed by the protocol and MUST NOT be
//! changed without a protocol version bump. The `DEFAULT_*` timing and
//! sizing values are only defaults for [`PeerConfig`](crate::peer::PeerConfig).

use std::time::Duration;

// =============================================================================
// UNIT CATEGORY TAGS
// =============================================================================

/// Application message that fits in a single unit.
pub const UNIT_USER: u8 = 0x01;

/// One fragment of an application message.
pub const UNIT_USER_FRAGMENT: u8 = 0x02;

/// Acknowledgment record for a reliable channel.
pub const UNIT_ACK: u8 = 0x03;

/// Library/system control message.
pub const UNIT_SYSTEM: u8 = 0x07;

// =============================================================================
// SYSTEM MESSAGE SUBTYPES
// =============================================================================

/// Connection request carrying the hail payload.
pub const SYSTEM_CONNECT: u8 = 1;

/// Response to a connection request.
pub const SYSTEM_CONNECT_RESPONSE: u8 = 2;

/// Final leg of the three-way handshake.
pub const SYSTEM_CONNECTION_ESTABLISHED: u8 = 3;

/// Best-effort disconnect notice with a reason.
pub const SYSTEM_DISCONNECT: u8 = 4;

/// Connection request refused by the acceptor.
pub const SYSTEM_CONNECTION_REJECTED: u8 = 5;

/// Local discovery request (handled outside the engine).
pub const SYSTEM_DISCOVERY: u8 = 50;

/// Local discovery response (handled outside the engine).
pub const SYSTEM_DISCOVERY_RESPONSE: u8 = 51;

/// NAT introduction (handled outside the engine).
pub const SYSTEM_NAT_INTRODUCTION: u8 = 52;

/// Application data sent without a connection.
pub const SYSTEM_UNCONNECTED_DATA: u8 = 53;

/// Round-trip probe.
pub const SYSTEM_PING: u8 = 100;

/// Echo of a round-trip probe.
pub const SYSTEM_PONG: u8 = 101;

// =============================================================================
// CHANNEL ID SPACE
// =============================================================================

/// Total number of channel ids (including reserved ones).
pub const CHANNEL_COUNT: usize = 64;

/// Highest id reserved for library use.
pub const RESERVED_CHANNEL_MAX: u8 = 13;

/// The single unreliable channel.
pub const CHANNEL_UNRELIABLE: u8 = 14;

/// First sequenced channel (slot 1).
pub const CHANNEL_SEQUENCED_BASE: u8 = 15;

/// The single reliable-unordered channel.
pub const CHANNEL_RELIABLE_UNORDERED: u8 = 31;

/// First reliable-sequenced channel (slot 1).
pub const CHANNEL_RELIABLE_SEQUENCED_BASE: u8 = 32;

/// First reliable-ordered channel (slot 1).
pub const CHANNEL_RELIABLE_ORDERED_BASE: u8 = 48;

/// Number of slots for each multi-slot delivery mode.
pub const SLOTS_PER_MODE: u8 = 16;

// =============================================================================
// UNIT SIZES
// =============================================================================

/// User unit header: tag + epoch + channel + seq + len.
pub const USER_HEADER_SIZE: usize = 1 + 1 + 1 + 2 + 2;

/// Fragment unit header: tag + epoch + channel + group + index + count + len.
pub const FRAGMENT_HEADER_SIZE: usize = 1 + 1 + 1 + 2 + 2 + 2 + 2;

/// Ack unit header: tag + epoch + channel + base + bitfield length.
pub const ACK_HEADER_SIZE: usize = 1 + 1 + 1 + 2 + 1;

/// System unit header: tag + subtype + len.
pub const SYSTEM_HEADER_SIZE: usize = 1 + 1 + 2;

/// Epoch byte leading the payload of Connect and ConnectResponse.
pub const HANDSHAKE_EPOCH_SIZE: usize = 1;

/// Smallest MTU the engine accepts.
pub const MIN_MTU: usize = 256;

/// Largest MTU the engine accepts (largest IPv4 UDP payload).
pub const MAX_MTU: usize = 65507;

/// Smallest accepted ack window.
pub const MIN_WINDOW_SIZE: u16 = 8;

/// Largest accepted ack window.
pub const MAX_WINDOW_SIZE: u16 = 1024;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default datagram size budget (bytes).
pub const DEFAULT_MTU: usize = 1408;

/// Default largest message accepted for sending.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default ack window (sequences covered by one ack record).
pub const DEFAULT_WINDOW_SIZE: u16 = 64;

/// Default in-flight message limit per reliable channel.
pub const DEFAULT_MAX_OUTSTANDING: usize = 64;

/// Default first retransmission timeout.
pub const DEFAULT_INITIAL_RESEND_DELAY: Duration = Duration::from_millis(200);

/// Default upper bound on the retransmission timeout.
pub const DEFAULT_MAX_RESEND_DELAY: Duration = Duration::from_secs(4);

/// Default number of retransmissions before a message is declared failed.
pub const DEFAULT_MAX_RESENDS: u32 = 8;

/// Default longest an ack may wait for piggybacking.
pub const DEFAULT_ACK_DELAY: Duration = Duration::from_millis(20);

/// Default lifetime of an incomplete reassembly group.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on concurrent reassembly groups per connection.
pub const DEFAULT_MAX_REASSEMBLY_GROUPS: usize = 32;

/// Default interval between handshake retries.
pub const DEFAULT_HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of handshake attempts before giving up.
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 8;

/// Default interval between pings on an idle connection.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Default silence after which the link is considered lost.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time spent in `Disconnecting` before `Disconnected`.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::ZERO;

/// Default maximum number of simultaneous connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default number of pooled datagram buffers.
pub const DEFAULT_POOLED_BUFFERS: usize = 64;

/// Default for holding incoming connections until the application approves them.
pub const DEFAULT_REQUIRE_APPROVAL: bool = false;

/// Default heartbeat interval of the tokio driver.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);
