//! Commands exchanged over the reserved request/reply channels.
//!
//! Each command on the byte stream is a `u32` big-endian body length followed
//! by the body: a `u8` opcode and the fields of that command. Integers are
//! big-endian, strings are `u16`-length-prefixed UTF-8, string lists are a
//! `u16` count followed by the strings.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chanmux_frame::ChannelId;
use tracing::trace;

use crate::error::{RemoteError, Result};

pub const OP_EXEC: u8 = 1;
pub const OP_STARTED: u8 = 2;
pub const OP_EXIT_CODE: u8 = 3;
pub const OP_BIND: u8 = 4;
pub const OP_BOUND: u8 = 5;
pub const OP_ACCEPT: u8 = 6;
pub const OP_ACCEPTED: u8 = 7;
pub const OP_LAUNCH_FAILED: u8 = 8;
pub const OP_ACCEPT_FAILED: u8 = 9;
pub const OP_BIND_FAILED: u8 = 10;

/// Largest command body accepted from the peer.
pub const MAX_COMMAND_SIZE: usize = 1024 * 1024;

const MAX_LIST_LEN: usize = u16::MAX as usize;
const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Launch request for one remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub proc_id: i64,
    /// Working directory; empty means the executor's own.
    pub work_dir: String,
    pub argv: Vec<String>,
    /// `KEY=VALUE` entries layered over the executor's environment.
    pub env: Vec<String>,
    /// Driver to process.
    pub stdin: ChannelId,
    /// Process to driver.
    pub stdout: ChannelId,
    /// Process to driver.
    pub stderr: ChannelId,
}

/// A decoded control command.
///
/// Requests flow driver to executor on the request channel; every reply
/// carries the correlation id of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exec(ExecRequest),
    Started {
        proc_id: i64,
    },
    ExitCode {
        proc_id: i64,
        code: i32,
    },
    LaunchFailed {
        proc_id: i64,
        message: String,
    },
    Bind {
        sock_id: i64,
    },
    Bound {
        sock_id: i64,
        host: String,
        port: u16,
    },
    BindFailed {
        sock_id: i64,
        message: String,
    },
    /// Accept one connection on a bound socket. `to_remote` carries bytes
    /// from the driver into the accepted socket, `from_remote` the reverse.
    Accept {
        sock_id: i64,
        cmd_id: i64,
        to_remote: ChannelId,
        from_remote: ChannelId,
    },
    Accepted {
        cmd_id: i64,
    },
    AcceptFailed {
        cmd_id: i64,
        message: String,
    },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Exec(_) => OP_EXEC,
            Command::Started { .. } => OP_STARTED,
            Command::ExitCode { .. } => OP_EXIT_CODE,
            Command::LaunchFailed { .. } => OP_LAUNCH_FAILED,
            Command::Bind { .. } => OP_BIND,
            Command::Bound { .. } => OP_BOUND,
            Command::BindFailed { .. } => OP_BIND_FAILED,
            Command::Accept { .. } => OP_ACCEPT,
            Command::Accepted { .. } => OP_ACCEPTED,
            Command::AcceptFailed { .. } => OP_ACCEPT_FAILED,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Exec(_) => "exec",
            Command::Started { .. } => "started",
            Command::ExitCode { .. } => "exit_code",
            Command::LaunchFailed { .. } => "launch_failed",
            Command::Bind { .. } => "bind",
            Command::Bound { .. } => "bound",
            Command::BindFailed { .. } => "bind_failed",
            Command::Accept { .. } => "accept",
            Command::Accepted { .. } => "accepted",
            Command::AcceptFailed { .. } => "accept_failed",
        }
    }

    /// Whether this command travels executor to driver.
    pub fn is_reply(&self) -> bool {
        !matches!(
            self,
            Command::Exec(_) | Command::Bind { .. } | Command::Accept { .. }
        )
    }

    /// Append the body (opcode and fields, without the length prefix).
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.opcode());
        match self {
            Command::Exec(req) => {
                dst.put_i64(req.proc_id);
                put_string(dst, &req.work_dir)?;
                put_list(dst, &req.argv)?;
                put_list(dst, &req.env)?;
                dst.put_i64(req.stdin);
                dst.put_i64(req.stdout);
                dst.put_i64(req.stderr);
            }
            Command::Started { proc_id } => dst.put_i64(*proc_id),
            Command::ExitCode { proc_id, code } => {
                dst.put_i64(*proc_id);
                dst.put_i32(*code);
            }
            Command::LaunchFailed { proc_id, message } => {
                dst.put_i64(*proc_id);
                put_string(dst, message)?;
            }
            Command::Bind { sock_id } => dst.put_i64(*sock_id),
            Command::Bound {
                sock_id,
                host,
                port,
            } => {
                dst.put_i64(*sock_id);
                put_string(dst, host)?;
                dst.put_u16(*port);
            }
            Command::BindFailed { sock_id, message } => {
                dst.put_i64(*sock_id);
                put_string(dst, message)?;
            }
            Command::Accept {
                sock_id,
                cmd_id,
                to_remote,
                from_remote,
            } => {
                dst.put_i64(*sock_id);
                dst.put_i64(*cmd_id);
                dst.put_i64(*to_remote);
                dst.put_i64(*from_remote);
            }
            Command::Accepted { cmd_id } => dst.put_i64(*cmd_id),
            Command::AcceptFailed { cmd_id, message } => {
                dst.put_i64(*cmd_id);
                put_string(dst, message)?;
            }
        }
        Ok(())
    }

    /// Decode one complete body. Trailing bytes are rejected.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        let opcode = get_u8(&mut src, "opcode")?;
        let command = match opcode {
            OP_EXEC => Command::Exec(ExecRequest {
                proc_id: get_i64(&mut src, "proc_id")?,
                work_dir: get_string(&mut src, "work_dir")?,
                argv: get_list(&mut src, "argv")?,
                env: get_list(&mut src, "env")?,
                stdin: get_i64(&mut src, "stdin")?,
                stdout: get_i64(&mut src, "stdout")?,
                stderr: get_i64(&mut src, "stderr")?,
            }),
            OP_STARTED => Command::Started {
                proc_id: get_i64(&mut src, "proc_id")?,
            },
            OP_EXIT_CODE => Command::ExitCode {
                proc_id: get_i64(&mut src, "proc_id")?,
                code: get_i32(&mut src, "code")?,
            },
            OP_LAUNCH_FAILED => Command::LaunchFailed {
                proc_id: get_i64(&mut src, "proc_id")?,
                message: get_string(&mut src, "message")?,
            },
            OP_BIND => Command::Bind {
                sock_id: get_i64(&mut src, "sock_id")?,
            },
            OP_BOUND => Command::Bound {
                sock_id: get_i64(&mut src, "sock_id")?,
                host: get_string(&mut src, "host")?,
                port: get_u16(&mut src, "port")?,
            },
            OP_BIND_FAILED => Command::BindFailed {
                sock_id: get_i64(&mut src, "sock_id")?,
                message: get_string(&mut src, "message")?,
            },
            OP_ACCEPT => Command::Accept {
                sock_id: get_i64(&mut src, "sock_id")?,
                cmd_id: get_i64(&mut src, "cmd_id")?,
                to_remote: get_i64(&mut src, "to_remote")?,
                from_remote: get_i64(&mut src, "from_remote")?,
            },
            OP_ACCEPTED => Command::Accepted {
                cmd_id: get_i64(&mut src, "cmd_id")?,
            },
            OP_ACCEPT_FAILED => Command::AcceptFailed {
                cmd_id: get_i64(&mut src, "cmd_id")?,
                message: get_string(&mut src, "message")?,
            },
            other => return Err(RemoteError::UnknownCommand(other)),
        };
        if src.has_remaining() {
            return Err(RemoteError::MalformedCommand(format!(
                "{} trailing bytes after {}",
                src.remaining(),
                command.name()
            )));
        }
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Exec(req) => write!(f, "exec#{} {:?}", req.proc_id, req.argv),
            Command::Started { proc_id } => write!(f, "started#{proc_id}"),
            Command::ExitCode { proc_id, code } => write!(f, "exit_code#{proc_id} {code}"),
            Command::LaunchFailed { proc_id, .. } => write!(f, "launch_failed#{proc_id}"),
            Command::Bind { sock_id } => write!(f, "bind#{sock_id}"),
            Command::Bound {
                sock_id,
                host,
                port,
            } => write!(f, "bound#{sock_id} {host}:{port}"),
            Command::BindFailed { sock_id, .. } => write!(f, "bind_failed#{sock_id}"),
            Command::Accept {
                sock_id, cmd_id, ..
            } => write!(f, "accept#{cmd_id} on socket {sock_id}"),
            Command::Accepted { cmd_id } => write!(f, "accepted#{cmd_id}"),
            Command::AcceptFailed { cmd_id, .. } => write!(f, "accept_failed#{cmd_id}"),
        }
    }
}

fn malformed(field: &str) -> RemoteError {
    RemoteError::MalformedCommand(format!("truncated field `{field}`"))
}

fn get_u8(src: &mut Bytes, field: &str) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(malformed(field));
    }
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes, field: &str) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(malformed(field));
    }
    Ok(src.get_u16())
}

fn get_i32(src: &mut Bytes, field: &str) -> Result<i32> {
    if src.remaining() < 4 {
        return Err(malformed(field));
    }
    Ok(src.get_i32())
}

fn get_i64(src: &mut Bytes, field: &str) -> Result<i64> {
    if src.remaining() < 8 {
        return Err(malformed(field));
    }
    Ok(src.get_i64())
}

fn get_string(src: &mut Bytes, field: &str) -> Result<String> {
    let len = get_u16(src, field)? as usize;
    if src.remaining() < len {
        return Err(malformed(field));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| {
        RemoteError::MalformedCommand(format!("field `{field}` is not valid UTF-8"))
    })
}

fn get_list(src: &mut Bytes, field: &str) -> Result<Vec<String>> {
    let count = get_u16(src, field)? as usize;
    (0..count).map(|_| get_string(src, field)).collect()
}

fn put_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    if value.len() > MAX_STRING_LEN {
        return Err(RemoteError::MalformedCommand(format!(
            "string of {} bytes exceeds {MAX_STRING_LEN}",
            value.len()
        )));
    }
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_list(dst: &mut BytesMut, values: &[String]) -> Result<()> {
    if values.len() > MAX_LIST_LEN {
        return Err(RemoteError::MalformedCommand(format!(
            "list of {} entries exceeds {MAX_LIST_LEN}",
            values.len()
        )));
    }
    dst.put_u16(values.len() as u16);
    values.iter().try_for_each(|value| put_string(dst, value))
}

/// Reads length-delimited commands from a control channel.
pub struct CommandReader<R> {
    inner: R,
}

impl<R: Read> CommandReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next command.
    ///
    /// Returns `Ok(None)` at a clean end of stream. A malformed or unknown
    /// command has already been consumed whole when its error is returned, so
    /// the caller can log it and keep reading; see
    /// [`RemoteError::is_recoverable`].
    pub fn read_command(&mut self) -> Result<Option<Command>> {
        let Some(len) = self.read_len()? else {
            return Ok(None);
        };

        if len > MAX_COMMAND_SIZE {
            io::copy(&mut (&mut self.inner).take(len as u64), &mut io::sink())?;
            return Err(RemoteError::MalformedCommand(format!(
                "command of {len} bytes exceeds {MAX_COMMAND_SIZE}"
            )));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body)?;
        let command = Command::decode(Bytes::from(body))?;
        trace!(command = %command, "command received");
        Ok(Some(command))
    }

    fn read_len(&mut self) -> Result<Option<usize>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(RemoteError::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "control stream ended inside a command header",
                    )))
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Some(u32::from_be_bytes(header) as usize))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes length-delimited commands to a control channel.
pub struct CommandWriter<W> {
    inner: W,
    body: BytesMut,
    buf: BytesMut,
}

impl<W: Write> CommandWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            body: BytesMut::new(),
            buf: BytesMut::new(),
        }
    }

    /// Encode and write one command. The whole command is written with a
    /// single `write_all`, so concurrent writers serialized by a lock never
    /// interleave.
    pub fn send(&mut self, command: &Command) -> Result<()> {
        self.body.clear();
        command.encode(&mut self.body)?;
        if self.body.len() > MAX_COMMAND_SIZE {
            return Err(RemoteError::MalformedCommand(format!(
                "{} body of {} bytes exceeds {MAX_COMMAND_SIZE}",
                command.name(),
                self.body.len()
            )));
        }

        self.buf.clear();
        self.buf.put_u32(self.body.len() as u32);
        self.buf.extend_from_slice(&self.body);
        self.inner.write_all(&self.buf)?;
        self.inner.flush()?;
        trace!(command = %command, "command sent");
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
