//! Channel multiplexing and remote process/socket control.
//!
//! A [`Connection`] runs one demultiplexer and one multiplexer thread over a
//! physical [`DuplexStream`](chanmux_transport::DuplexStream). On top of it:
//! - [`Executor`]: the server role, spawning processes and sockets on request
//! - [`Driver`]: the client role, issuing requests and routing replies to
//!   [`ExecHandler`] / [`SocketHandler`] callbacks

pub mod config;
pub mod connection;
pub mod control;
pub mod demux;
pub mod driver;
pub mod error;
pub mod executor;
pub mod handler;
pub mod mux;
pub mod registry;

pub use config::{ConnectionConfig, DEFAULT_MUX_POLL_INTERVAL};
pub use connection::Connection;
pub use control::{Command, CommandReader, CommandWriter, ExecRequest, MAX_COMMAND_SIZE};
pub use demux::{Demultiplexer, Dispatch};
pub use driver::{Driver, CONNECTION_TERMINATED};
pub use error::{RemoteError, Result};
pub use executor::{exit_code, Executor, LOOPBACK_HOST};
pub use handler::{
    ExecEvent, ExecHandler, SocketEvent, SocketHandler, EXIT_CONNECTION_LOST, EXIT_LAUNCH_FAILED,
};
pub use mux::Multiplexer;
pub use registry::ChannelRegistry;
