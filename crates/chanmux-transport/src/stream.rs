use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::process::Child;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{Result, TransportError};

/// Read half of a physical stream.
pub type BoxRead = Box<dyn Read + Send>;
/// Write half of a physical stream.
pub type BoxWrite = Box<dyn Write + Send>;

/// Unblocks a thread parked in a read on the physical stream.
///
/// Used at shutdown so the demultiplexer can be joined. Streams without a
/// hook (plain stdio) leave the reader blocked until the peer closes.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self) -> std::io::Result<()>;
}

impl<F> Interrupt for F
where
    F: Fn() -> std::io::Result<()> + Send + Sync,
{
    fn interrupt(&self) -> std::io::Result<()> {
        self()
    }
}

/// The single duplex byte stream every channel is multiplexed over.
///
/// The multiplexer does not care how the stream was established: an
/// SSH-forwarded pipe, the stdio of a bootstrap process, or a socket all look
/// the same once split into halves.
pub struct DuplexStream {
    reader: BoxRead,
    writer: BoxWrite,
    interrupt: Option<Box<dyn Interrupt>>,
    kind: &'static str,
}

impl DuplexStream {
    /// Build a stream from arbitrary halves.
    pub fn from_parts(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            interrupt: None,
            kind: "custom",
        }
    }

    /// Attach a hook used to unblock the reader at shutdown.
    pub fn with_interrupt(mut self, hook: impl Interrupt + 'static) -> Self {
        self.interrupt = Some(Box::new(hook));
        self
    }

    /// Wrap a connected Unix domain socket.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(stream),
            interrupt: Some(Box::new(move || control.shutdown(Shutdown::Both))),
            kind: "unix",
        })
    }

    /// Wrap a connected TCP socket.
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(stream),
            interrupt: Some(Box::new(move || control.shutdown(Shutdown::Both))),
            kind: "tcp",
        })
    }

    /// Talk to a spawned bootstrap process over its stdin/stdout.
    ///
    /// Both must have been configured with `Stdio::piped()`. Interrupting the
    /// stream kills and reaps the child.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::other("child stdin is not piped"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::other("child stdout is not piped"))
        })?;
        let pid = child.id();
        debug!(pid, "wrapping bootstrap process stdio");

        let child = Mutex::new(child);
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            interrupt: Some(Box::new(move || {
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                if child.try_wait()?.is_none() {
                    child.kill()?;
                    child.wait()?;
                }
                Ok(())
            })),
            kind: "child",
        })
    }

    /// The current process' stdin/stdout.
    pub fn stdio() -> Self {
        Self {
            reader: Box::new(std::io::stdin()),
            writer: Box::new(std::io::stdout()),
            interrupt: None,
            kind: "stdio",
        }
    }

    /// Short name of the underlying stream type, for diagnostics.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Whether a blocked reader can be interrupted.
    pub fn can_interrupt(&self) -> bool {
        self.interrupt.is_some()
    }

    /// Split into read half, write half and optional interrupt hook.
    pub fn into_split(self) -> (BoxRead, BoxWrite, Option<Box<dyn Interrupt>>) {
        (self.reader, self.writer, self.interrupt)
    }
}

impl std::fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("type", &self.kind)
            .field("interruptible", &self.interrupt.is_some())
            .finish()
    }
}
