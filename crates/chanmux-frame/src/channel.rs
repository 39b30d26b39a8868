//! Channel identifiers and direction.
//!
//! Negative ids are reserved for the control protocol and exist on both ends
//! for the lifetime of a connection. Non-negative ids are allocated on demand
//! for exec stdio and accepted socket streams.

/// Numeric id of a logical channel.
pub type ChannelId = i64;

/// Control requests (driver → executor).
pub const REQUEST: ChannelId = -1;

/// Control replies (executor → driver).
pub const REPLY: ChannelId = -2;

/// First id handed out for dynamically allocated channels.
pub const FIRST_DYNAMIC: ChannelId = 1;

/// Direction of a channel relative to the local multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes arrive from the wire and are consumed locally.
    Inbound,
    /// Bytes are produced locally and sent over the wire.
    Outbound,
}

impl Direction {
    /// The direction the same channel has on the other end of the wire.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Returns a human-readable name for a channel id.
pub fn channel_name(id: ChannelId) -> &'static str {
    match id {
        REQUEST => "REQUEST",
        REPLY => "REPLY",
        i64::MIN..=-3 => "RESERVED",
        _ => "DATA",
    }
}

/// Returns true if the channel id is reserved for the control protocol.
pub fn is_reserved(id: ChannelId) -> bool {
    id < 0
}
