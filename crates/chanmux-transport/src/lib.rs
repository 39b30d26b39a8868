//! Bounded pipes and the physical-stream abstraction.
//!
//! This is the lowest layer of chanmux:
//! - [`Pipe`]: a fixed-capacity circular byte buffer with blocking
//!   read/write endpoints and independent half-close
//! - [`DataSignal`]: the "data pending" semaphore producers post to
//! - [`DuplexStream`]: the single physical byte stream everything is
//!   multiplexed over

pub mod error;
pub mod pipe;
pub mod signal;
pub mod stream;

pub use error::{Result, TransportError};
pub use pipe::{pipe, Pipe, PipeReader, PipeWriter, ReadOutcome, DEFAULT_PIPE_CAPACITY};
pub use signal::DataSignal;
pub use stream::{BoxRead, BoxWrite, DuplexStream, Interrupt};
