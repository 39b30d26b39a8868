use chanmux_frame::ChannelId;

/// Errors that can occur in multiplexer and control-protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Transport-level error (pipe or physical stream).
    #[error("transport error: {0}")]
    Transport(#[from] chanmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] chanmux_frame::FrameError),

    /// A channel with this id is already open on this connection.
    #[error("channel {0} is already open")]
    ChannelInUse(ChannelId),

    /// A control command could not be decoded.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// A control command carried an opcode this side does not know.
    #[error("unknown command opcode {0}")]
    UnknownCommand(u8),

    /// The connection configuration violates an invariant.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The connection has terminated; no further channels can be opened.
    #[error("connection terminated")]
    Terminated,

    /// An I/O error outside the physical stream (process spawn, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Whether the error only affects a single command and the control loop
    /// can keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RemoteError::MalformedCommand(_) | RemoteError::UnknownCommand(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
