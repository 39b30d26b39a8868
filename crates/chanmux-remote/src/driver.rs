use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chanmux_frame::{ChannelId, FIRST_DYNAMIC, REPLY, REQUEST};
use chanmux_transport::{DuplexStream, PipeReader, PipeWriter};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{spawn_named, Connection};
use crate::control::{Command, CommandReader, CommandWriter, ExecRequest};
use crate::error::Result;
use crate::handler::{ExecHandler, SocketHandler, EXIT_CONNECTION_LOST};

/// Message passed to socket handlers still open when the connection dies.
pub const CONNECTION_TERMINATED: &str = "connection terminated";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ExecStreams {
    stdin: PipeWriter,
    stdout: PipeReader,
    stderr: PipeReader,
}

struct ExecContext {
    handler: Arc<dyn ExecHandler>,
    // Handed to the handler on `Started`.
    streams: Option<ExecStreams>,
}

struct SocketContext {
    handler: Arc<dyn SocketHandler>,
}

struct AcceptContext {
    sock_id: i64,
    to_remote: PipeWriter,
    from_remote: PipeReader,
}

struct DriverState {
    connection: Connection,
    requests: Mutex<CommandWriter<PipeWriter>>,
    next_channel: AtomicI64,
    next_proc: AtomicI64,
    next_sock: AtomicI64,
    next_cmd: AtomicI64,
    execs: Mutex<HashMap<i64, ExecContext>>,
    sockets: Mutex<HashMap<i64, SocketContext>>,
    accepts: Mutex<HashMap<i64, AcceptContext>>,
    shut_down: AtomicBool,
}

/// Client role: issues commands to a remote [`Executor`](crate::Executor)
/// and routes its replies to handlers.
///
/// Handlers are invoked from a single reply thread, in reply order.
pub struct Driver {
    state: Arc<DriverState>,
    reply_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    /// Start a connection over `stream` with the control channels open and
    /// the reply thread running.
    pub fn connect(stream: DuplexStream, config: ConnectionConfig) -> Result<Self> {
        let (connection, (requests, replies)) =
            Connection::start_with(stream, config, |registry| {
                Ok((registry.open_outbound(REQUEST)?, registry.open_inbound(REPLY)?))
            })?;

        let state = Arc::new(DriverState {
            connection: connection.clone(),
            requests: Mutex::new(CommandWriter::new(requests)),
            next_channel: AtomicI64::new(FIRST_DYNAMIC),
            next_proc: AtomicI64::new(1),
            next_sock: AtomicI64::new(1),
            next_cmd: AtomicI64::new(1),
            execs: Mutex::new(HashMap::new()),
            sockets: Mutex::new(HashMap::new()),
            accepts: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        });

        let replies = CommandReader::new(replies);
        let reply_thread = match spawn_named("chanmux-replies", {
            let state = Arc::clone(&state);
            move || state.read_replies(replies)
        }) {
            Ok(handle) => handle,
            Err(err) => {
                connection.shutdown();
                return Err(err);
            }
        };

        Ok(Self {
            state,
            reply_thread: Mutex::new(Some(reply_thread)),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.state.connection
    }

    /// Launch `argv` remotely. Returns the process id used in callbacks.
    ///
    /// `env` entries are `KEY=VALUE` and are layered over the executor's
    /// environment. An empty `work_dir` means the executor's own.
    pub fn exec(
        &self,
        work_dir: impl Into<String>,
        argv: Vec<String>,
        env: Vec<String>,
        handler: Arc<dyn ExecHandler>,
    ) -> Result<i64> {
        let state = &self.state;
        let proc_id = state.next_proc.fetch_add(1, Ordering::SeqCst);
        let (stdin_id, stdout_id, stderr_id) =
            (state.alloc_channel(), state.alloc_channel(), state.alloc_channel());

        let streams = ExecStreams {
            stdin: state.connection.open_outbound(stdin_id)?,
            stdout: state.connection.open_inbound(stdout_id)?,
            stderr: state.connection.open_inbound(stderr_id)?,
        };
        lock(&state.execs).insert(
            proc_id,
            ExecContext {
                handler,
                streams: Some(streams),
            },
        );

        let request = Command::Exec(ExecRequest {
            proc_id,
            work_dir: work_dir.into(),
            argv,
            env,
            stdin: stdin_id,
            stdout: stdout_id,
            stderr: stderr_id,
        });
        if let Err(err) = state.send(&request) {
            lock(&state.execs).remove(&proc_id);
            return Err(err);
        }
        debug!(
            proc_id,
            stdin = stdin_id,
            stdout = stdout_id,
            stderr = stderr_id,
            "exec requested"
        );
        Ok(proc_id)
    }

    /// Bind a listening socket on the executor's loopback interface.
    ///
    /// Every accepted connection is handed to `handler`, and the next accept
    /// is requested immediately, so the socket keeps listening until the
    /// connection ends or an accept fails.
    pub fn new_socket(&self, handler: Arc<dyn SocketHandler>) -> Result<i64> {
        let state = &self.state;
        let sock_id = state.next_sock.fetch_add(1, Ordering::SeqCst);
        lock(&state.sockets).insert(sock_id, SocketContext { handler });

        if let Err(err) = state.send(&Command::Bind { sock_id }) {
            lock(&state.sockets).remove(&sock_id);
            return Err(err);
        }
        debug!(sock_id, "bind requested");
        Ok(sock_id)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.connection.is_terminated()
    }

    /// Close the connection and join the reply thread. Pending execs get
    /// `finished(-1)`, open sockets get `terminated`. Idempotent.
    pub fn shutdown(&self) {
        if self.state.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("driver shutting down");
        self.state.connection.shutdown();

        let handle = lock(&self.reply_thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("reply thread panicked");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("connection", &self.state.connection)
            .field("pending_execs", &lock(&self.state.execs).len())
            .field("sockets", &lock(&self.state.sockets).len())
            .finish()
    }
}

impl DriverState {
    fn alloc_channel(&self) -> ChannelId {
        self.next_channel.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, command: &Command) -> Result<()> {
        lock(&self.requests).send(command)
    }

    fn read_replies(&self, mut replies: CommandReader<PipeReader>) {
        loop {
            match replies.read_command() {
                Ok(Some(command)) => self.handle_reply(command),
                Ok(None) => {
                    debug!("reply channel closed");
                    break;
                }
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "skipping malformed reply");
                }
                Err(err) => {
                    error!(error = %err, "reply channel failed");
                    break;
                }
            }
        }
        self.fail_pending();
    }

    fn handle_reply(&self, command: Command) {
        debug!(command = %command, "reply received");
        match command {
            Command::Started { proc_id } => {
                let started = lock(&self.execs).get_mut(&proc_id).map(|ctx| {
                    (Arc::clone(&ctx.handler), ctx.streams.take())
                });
                match started {
                    Some((handler, Some(s))) => handler.started(s.stdin, s.stdout, s.stderr),
                    Some((_, None)) => warn!(proc_id, "duplicate started reply ignored"),
                    None => warn!(proc_id, "started reply for unknown process"),
                }
            }
            Command::ExitCode { proc_id, code } => {
                let ctx = lock(&self.execs).remove(&proc_id);
                match ctx {
                    Some(ctx) => {
                        debug!(proc_id, code, "process finished");
                        drop(ctx.streams);
                        ctx.handler.finished(code);
                    }
                    None => warn!(proc_id, "exit code for unknown process"),
                }
            }
            Command::LaunchFailed { proc_id, message } => {
                let ctx = lock(&self.execs).remove(&proc_id);
                match ctx {
                    Some(ctx) => {
                        warn!(proc_id, message = %message, "remote launch failed");
                        drop(ctx.streams);
                        ctx.handler.launch_failed(&message);
                    }
                    None => warn!(proc_id, "launch failure for unknown process"),
                }
            }
            Command::Bound {
                sock_id,
                host,
                port,
            } => {
                let Some(handler) = self.socket_handler(sock_id) else {
                    warn!(sock_id, "bound reply for unknown socket");
                    return;
                };
                info!(sock_id, host = %host, port, "remote socket bound");
                handler.bound(&host, port);
                self.arm_accept(sock_id);
            }
            Command::BindFailed { sock_id, message } => {
                let ctx = lock(&self.sockets).remove(&sock_id);
                match ctx {
                    Some(ctx) => {
                        warn!(sock_id, message = %message, "remote bind failed");
                        ctx.handler.terminated(&message);
                    }
                    None => warn!(sock_id, "bind failure for unknown socket"),
                }
            }
            Command::Accepted { cmd_id } => {
                let accept = lock(&self.accepts).remove(&cmd_id);
                let Some(accept) = accept else {
                    warn!(cmd_id, "accepted reply for unknown accept");
                    return;
                };
                let Some(handler) = self.socket_handler(accept.sock_id) else {
                    debug!(cmd_id, "socket closed before accept completed");
                    return;
                };
                debug!(cmd_id, sock_id = accept.sock_id, "remote connection accepted");
                handler.accepted(accept.from_remote, accept.to_remote);
                self.arm_accept(accept.sock_id);
            }
            Command::AcceptFailed { cmd_id, message } => {
                let accept = lock(&self.accepts).remove(&cmd_id);
                let Some(accept) = accept else {
                    warn!(cmd_id, "accept failure for unknown accept");
                    return;
                };
                drop((accept.to_remote, accept.from_remote));
                let ctx = lock(&self.sockets).remove(&accept.sock_id);
                if let Some(ctx) = ctx {
                    warn!(
                        cmd_id,
                        sock_id = accept.sock_id,
                        message = %message,
                        "remote accept failed"
                    );
                    ctx.handler.terminated(&message);
                }
            }
            other => warn!(command = other.name(), "request received on reply channel; ignored"),
        }
    }

    fn socket_handler(&self, sock_id: i64) -> Option<Arc<dyn SocketHandler>> {
        lock(&self.sockets)
            .get(&sock_id)
            .map(|ctx| Arc::clone(&ctx.handler))
    }

    /// Request the next accept on `sock_id`.
    fn arm_accept(&self, sock_id: i64) {
        if self.shut_down.load(Ordering::SeqCst) || self.connection.is_terminated() {
            return;
        }
        let cmd_id = self.next_cmd.fetch_add(1, Ordering::SeqCst);
        let (to_remote_id, from_remote_id) = (self.alloc_channel(), self.alloc_channel());

        let opened = self.connection.open_outbound(to_remote_id).and_then(|to_remote| {
            let from_remote = self.connection.open_inbound(from_remote_id)?;
            Ok((to_remote, from_remote))
        });
        let (to_remote, from_remote) = match opened {
            Ok(pipes) => pipes,
            Err(err) => {
                debug!(sock_id, error = %err, "cannot arm accept");
                return;
            }
        };
        lock(&self.accepts).insert(
            cmd_id,
            AcceptContext {
                sock_id,
                to_remote,
                from_remote,
            },
        );

        let request = Command::Accept {
            sock_id,
            cmd_id,
            to_remote: to_remote_id,
            from_remote: from_remote_id,
        };
        if let Err(err) = self.send(&request) {
            lock(&self.accepts).remove(&cmd_id);
            debug!(sock_id, error = %err, "accept request not sent");
        }
    }

    /// Settle every outstanding context once the reply channel is gone.
    fn fail_pending(&self) {
        let execs: Vec<_> = lock(&self.execs).drain().collect();
        let accepts = std::mem::take(&mut *lock(&self.accepts));
        let sockets: Vec<_> = lock(&self.sockets).drain().collect();
        drop(accepts);

        if !execs.is_empty() || !sockets.is_empty() {
            info!(
                execs = execs.len(),
                sockets = sockets.len(),
                "failing pending operations"
            );
        }
        for (_, ctx) in execs {
            drop(ctx.streams);
            ctx.handler.finished(EXIT_CONNECTION_LOST);
        }
        for (_, ctx) in sockets {
            ctx.handler.terminated(CONNECTION_TERMINATED);
        }
    }
}
