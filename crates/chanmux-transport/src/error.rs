/// Errors that can occur in transport and pipe operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The reading side of a pipe has been closed.
    #[error("pipe closed by reader")]
    ReaderClosed,

    /// The writing side of a pipe has been closed.
    #[error("pipe closed by writer")]
    WriterClosed,

    /// An I/O error occurred on the physical stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl From<TransportError> for std::io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(io) => io,
            TransportError::ReaderClosed | TransportError::WriterClosed => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, err.to_string())
            }
            TransportError::Shutdown => {
                std::io::Error::new(std::io::ErrorKind::NotConnected, err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
