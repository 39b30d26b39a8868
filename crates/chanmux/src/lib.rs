//! Run processes and proxy sockets on a remote host over one byte stream.
//!
//! chanmux multiplexes any number of logical byte channels over a single
//! duplex stream (an SSH-forwarded pipe, a bootstrap process' stdio, a
//! socket) and layers a small command protocol on top to launch remote
//! processes and accept remote TCP connections.
//!
//! # Crate Structure
//!
//! - [`transport`]: bounded pipes and the physical stream abstraction
//! - [`frame`]: channel-addressed wire framing
//! - [`remote`]: the multiplexer, the control protocol, `Executor` and `Driver`

/// Re-export transport types.
pub mod transport {
    pub use chanmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use chanmux_frame::*;
}

/// Re-export multiplexer and control-protocol types.
pub mod remote {
    pub use chanmux_remote::*;
}

pub use chanmux_remote::{
    Connection, ConnectionConfig, Driver, ExecEvent, ExecHandler, Executor, RemoteError,
    SocketEvent, SocketHandler,
};
pub use chanmux_transport::{DuplexStream, PipeReader, PipeWriter};
