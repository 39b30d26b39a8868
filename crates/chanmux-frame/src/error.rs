use std::io;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A payload longer than the negotiated frame limit.
    #[error("frame payload of {size} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// The stream ended between two frames.
    #[error("stream closed")]
    ConnectionClosed,

    /// The stream ended part way through a frame.
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the peer simply went away, as opposed to a broken stream.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, FrameError::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
