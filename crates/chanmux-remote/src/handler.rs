use std::sync::mpsc::Sender;

use chanmux_transport::{PipeReader, PipeWriter};

/// Exit code reported when a process could not be launched.
pub const EXIT_LAUNCH_FAILED: i32 = -1;
/// Exit code reported for execs still pending when the connection dies.
pub const EXIT_CONNECTION_LOST: i32 = -1;

/// Callbacks for one remote process.
///
/// Invoked from the driver's reply thread; implementations must not block
/// for long. `started` fires at most once and always before `finished`;
/// `finished` fires exactly once.
pub trait ExecHandler: Send + Sync {
    /// The process is running. Dropping `stdin` closes the process' stdin.
    fn started(&self, stdin: PipeWriter, stdout: PipeReader, stderr: PipeReader);

    fn finished(&self, exit_code: i32);

    /// The process never started. `started` will not fire.
    fn launch_failed(&self, message: &str) {
        let _ = message;
        self.finished(EXIT_LAUNCH_FAILED);
    }
}

/// Callbacks for one remote listening socket.
pub trait SocketHandler: Send + Sync {
    /// The socket is listening at `host:port` on the executor's side.
    fn bound(&self, host: &str, port: u16);

    /// A remote client connected. Bytes from the client arrive on `input`;
    /// bytes written to `output` go to the client.
    fn accepted(&self, input: PipeReader, output: PipeWriter);

    /// No further `accepted` calls will happen for this socket.
    fn terminated(&self, message: &str);
}

/// Exec callbacks as channel messages.
#[derive(Debug)]
pub enum ExecEvent {
    Started {
        stdin: PipeWriter,
        stdout: PipeReader,
        stderr: PipeReader,
    },
    LaunchFailed(String),
    Finished(i32),
}

impl ExecHandler for Sender<ExecEvent> {
    fn started(&self, stdin: PipeWriter, stdout: PipeReader, stderr: PipeReader) {
        let _ = self.send(ExecEvent::Started {
            stdin,
            stdout,
            stderr,
        });
    }

    fn finished(&self, exit_code: i32) {
        let _ = self.send(ExecEvent::Finished(exit_code));
    }

    fn launch_failed(&self, message: &str) {
        let _ = self.send(ExecEvent::LaunchFailed(message.to_string()));
        self.finished(EXIT_LAUNCH_FAILED);
    }
}

/// Socket callbacks as channel messages.
#[derive(Debug)]
pub enum SocketEvent {
    Bound { host: String, port: u16 },
    Accepted { input: PipeReader, output: PipeWriter },
    Terminated(String),
}

impl SocketHandler for Sender<SocketEvent> {
    fn bound(&self, host: &str, port: u16) {
        let _ = self.send(SocketEvent::Bound {
            host: host.to_string(),
            port,
        });
    }

    fn accepted(&self, input: PipeReader, output: PipeWriter) {
        let _ = self.send(SocketEvent::Accepted { input, output });
    }

    fn terminated(&self, message: &str) {
        let _ = self.send(SocketEvent::Terminated(message.to_string()));
    }
}
