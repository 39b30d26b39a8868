use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chanmux_frame::{ChannelId, REPLY, REQUEST};
use chanmux_transport::{DuplexStream, Pipe, PipeReader, PipeWriter};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{spawn_named, Connection};
use crate::control::{Command, CommandReader, CommandWriter, ExecRequest};
use crate::error::{RemoteError, Result};
use crate::handler::EXIT_LAUNCH_FAILED;

/// Host every bound socket listens on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// How long a pump may stay parked in `read` after its process exited
/// before the output is treated as held open by a descendant.
const OUTPUT_GRACE: Duration = Duration::from_millis(200);
const DRAIN_TICK: Duration = Duration::from_millis(10);
const PUMP_CHUNK: usize = 8 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server role: runs commands received from a [`Driver`](crate::Driver).
///
/// Processes and sockets are created on this side; their bytes travel
/// through channels the driver allocated and named in the command.
pub struct Executor {
    requests: CommandReader<PipeReader>,
    state: Arc<ExecutorState>,
}

struct ExecutorState {
    connection: Connection,
    replies: Mutex<CommandWriter<PipeWriter>>,
    listeners: Mutex<HashMap<i64, Arc<TcpListener>>>,
    processes: Mutex<HashMap<i64, u32>>,
    closing: AtomicBool,
}

impl Executor {
    /// Start a connection over `stream` with the control channels open.
    pub fn start(stream: DuplexStream, config: ConnectionConfig) -> Result<Self> {
        let (connection, (requests, replies)) =
            Connection::start_with(stream, config, |registry| {
                Ok((registry.open_inbound(REQUEST)?, registry.open_outbound(REPLY)?))
            })?;
        Ok(Self {
            requests: CommandReader::new(requests),
            state: Arc::new(ExecutorState {
                connection,
                replies: Mutex::new(CommandWriter::new(replies)),
                listeners: Mutex::new(HashMap::new()),
                processes: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        })
    }

    /// Serve commands arriving on `stream` until the driver goes away.
    pub fn serve(stream: DuplexStream, config: ConnectionConfig) -> Result<()> {
        let executor = Executor::start(stream, config)?;
        let connection = executor.connection().clone();
        let result = executor.run();
        connection.shutdown();
        result
    }

    pub fn connection(&self) -> &Connection {
        &self.state.connection
    }

    /// Run the control loop until the request channel ends.
    ///
    /// Malformed commands are logged and skipped. A failure writing a reply
    /// means the control stream is gone and ends the loop with an error.
    pub fn run(mut self) -> Result<()> {
        info!("executor ready");
        let result = loop {
            match self.requests.read_command() {
                Ok(Some(command)) => {
                    if let Err(err) = self.state.handle(command) {
                        error!(error = %err, "control stream failed");
                        break Err(err);
                    }
                }
                Ok(None) => {
                    debug!("request channel closed");
                    break Ok(());
                }
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "skipping malformed command");
                }
                Err(err) => {
                    error!(error = %err, "request channel failed");
                    break Err(err);
                }
            }
        };
        self.state.teardown();
        result
    }
}

impl ExecutorState {
    fn handle(self: &Arc<Self>, command: Command) -> Result<()> {
        debug!(command = %command, "request received");
        match command {
            Command::Exec(request) => self.exec(request),
            Command::Bind { sock_id } => self.bind(sock_id),
            Command::Accept {
                sock_id,
                cmd_id,
                to_remote,
                from_remote,
            } => self.accept(sock_id, cmd_id, to_remote, from_remote),
            other => {
                warn!(command = other.name(), "reply received on request channel; ignored");
                Ok(())
            }
        }
    }

    fn reply(&self, command: &Command) -> Result<()> {
        lock(&self.replies).send(command)
    }

    /// Reply from a worker thread, where a dead control stream only needs
    /// logging: the control loop notices it too.
    fn reply_or_log(&self, command: &Command) {
        if let Err(err) = self.reply(command) {
            debug!(command = command.name(), error = %err, "reply dropped");
        }
    }

    fn exec(self: &Arc<Self>, request: ExecRequest) -> Result<()> {
        let proc_id = request.proc_id;
        let (stdin, stdout, mut stderr) = match self.open_exec_channels(&request) {
            Ok(channels) => channels,
            Err(err) => {
                warn!(proc_id, error = %err, "cannot open process channels");
                return self.reply(&Command::LaunchFailed {
                    proc_id,
                    message: err.to_string(),
                });
            }
        };

        let child = match spawn_process(&request) {
            Ok(child) => child,
            Err(err) => {
                let program = request.argv.first().map(String::as_str).unwrap_or("");
                let message = format!("cannot launch `{program}`: {err}");
                warn!(proc_id, program, error = %err, "process launch failed");
                if let Err(err) = stderr.write_all(message.as_bytes()) {
                    debug!(proc_id, error = %err, "launch failure not written to stderr");
                }
                drop((stdin, stdout, stderr));
                return self.reply(&Command::LaunchFailed { proc_id, message });
            }
        };

        let pid = child.id();
        lock(&self.processes).insert(proc_id, pid);
        info!(proc_id, pid, argv = ?request.argv, "process started");
        if let Err(err) = self.reply(&Command::Started { proc_id }) {
            lock(&self.processes).remove(&proc_id);
            kill_and_reap(proc_id, child);
            return Err(err);
        }

        // The child is handed over only once the thread exists, so a failed
        // spawn leaves it here to be reaped.
        let state = Arc::clone(self);
        let (handoff, handed) = mpsc::channel::<Child>();
        let supervisor = spawn_named(format!("chanmux-proc-{proc_id}"), move || {
            if let Ok(child) = handed.recv() {
                state.supervise(proc_id, child, stdin, stdout, stderr);
            }
        });
        let unsupervised = match supervisor {
            Ok(_) => handoff.send(child).err().map(|returned| returned.0),
            Err(err) => {
                error!(proc_id, error = %err, "cannot start process supervisor");
                Some(child)
            }
        };
        if let Some(child) = unsupervised {
            lock(&self.processes).remove(&proc_id);
            kill_and_reap(proc_id, child);
            self.reply_or_log(&Command::ExitCode {
                proc_id,
                code: EXIT_LAUNCH_FAILED,
            });
        }
        Ok(())
    }

    fn open_exec_channels(
        &self,
        request: &ExecRequest,
    ) -> Result<(PipeReader, PipeWriter, PipeWriter)> {
        let connection = &self.connection;
        let stdin = connection.open_inbound(request.stdin)?;
        let stdout = match connection.open_outbound(request.stdout) {
            Ok(stdout) => stdout,
            Err(err) => {
                connection.remove_channel(request.stdin);
                return Err(err);
            }
        };
        let stderr = match connection.open_outbound(request.stderr) {
            Ok(stderr) => stderr,
            Err(err) => {
                connection.remove_channel(request.stdin);
                connection.remove_channel(request.stdout);
                return Err(err);
            }
        };
        Ok((stdin, stdout, stderr))
    }

    /// Pump a running process' stdio and report its exit code.
    ///
    /// The exit code goes out once the process' own output is drained.
    /// Descendants that inherited stdout or stderr do not hold it back: see
    /// [`drain_outputs`].
    fn supervise(
        &self,
        proc_id: i64,
        mut child: Child,
        stdin: PipeReader,
        stdout: PipeWriter,
        stderr: PipeWriter,
    ) {
        let stdin_pipe = stdin.pipe().clone();
        if let Some(child_stdin) = child.stdin.take() {
            // Never joined: a descendant may keep the process' stdin open.
            spawn_pump(format!("chanmux-proc-{proc_id}-in"), stdin, child_stdin);
        }

        let mut outputs = Vec::with_capacity(2);
        outputs.extend(child.stdout.take().and_then(|from| {
            spawn_output_pump(format!("chanmux-proc-{proc_id}-out"), from, stdout)
        }));
        outputs.extend(child.stderr.take().and_then(|from| {
            spawn_output_pump(format!("chanmux-proc-{proc_id}-err"), from, stderr)
        }));

        let code = self.reap(proc_id, &mut child);
        let exited = Instant::now();

        // Unblock the stdin pump if the driver never closed stdin.
        stdin_pipe.close_by_reader();
        drain_outputs(proc_id, outputs, exited, OUTPUT_GRACE);

        info!(proc_id, code, "process exited");
        self.reply_or_log(&Command::ExitCode { proc_id, code });
    }

    /// Wait for the process to exit and collect its status.
    ///
    /// Its pid leaves `processes` while the process is still a zombie, so
    /// teardown never signals a pid the system has handed out again.
    fn reap(&self, proc_id: i64, child: &mut Child) -> i32 {
        if let Err(err) = wait_until_exited(child) {
            debug!(proc_id, error = %err, "cannot wait without reaping");
        }
        lock(&self.processes).remove(&proc_id);
        match child.wait() {
            Ok(status) => exit_code(status),
            Err(err) => {
                warn!(proc_id, error = %err, "cannot wait for process");
                EXIT_LAUNCH_FAILED
            }
        }
    }

    fn bind(&self, sock_id: i64) -> Result<()> {
        match TcpListener::bind((LOOPBACK_HOST, 0)).and_then(|l| Ok((l.local_addr()?, l))) {
            Ok((addr, listener)) => {
                lock(&self.listeners).insert(sock_id, Arc::new(listener));
                info!(sock_id, %addr, "socket bound");
                self.reply(&Command::Bound {
                    sock_id,
                    host: LOOPBACK_HOST.to_string(),
                    port: addr.port(),
                })
            }
            Err(err) => {
                warn!(sock_id, error = %err, "bind failed");
                self.reply(&Command::BindFailed {
                    sock_id,
                    message: err.to_string(),
                })
            }
        }
    }

    fn accept(
        self: &Arc<Self>,
        sock_id: i64,
        cmd_id: i64,
        to_remote: ChannelId,
        from_remote: ChannelId,
    ) -> Result<()> {
        let Some(listener) = lock(&self.listeners).get(&sock_id).cloned() else {
            warn!(sock_id, cmd_id, "accept on unknown socket");
            return self.reply(&Command::AcceptFailed {
                cmd_id,
                message: format!("socket {sock_id} is not bound"),
            });
        };

        let connection = &self.connection;
        let input = match connection.open_inbound(to_remote) {
            Ok(input) => input,
            Err(err) => return self.reply_accept_failed(cmd_id, &err),
        };
        let output = match connection.open_outbound(from_remote) {
            Ok(output) => output,
            Err(err) => {
                connection.remove_channel(to_remote);
                return self.reply_accept_failed(cmd_id, &err);
            }
        };

        let state = Arc::clone(self);
        match spawn_named(format!("chanmux-accept-{cmd_id}"), move || {
            state.accept_one(&listener, cmd_id, input, output)
        }) {
            Ok(_) => Ok(()),
            Err(err) => self.reply_accept_failed(cmd_id, &err),
        }
    }

    fn reply_accept_failed(&self, cmd_id: i64, err: &RemoteError) -> Result<()> {
        warn!(cmd_id, error = %err, "cannot start accept");
        self.reply(&Command::AcceptFailed {
            cmd_id,
            message: err.to_string(),
        })
    }

    fn accept_one(
        &self,
        listener: &TcpListener,
        cmd_id: i64,
        input: PipeReader,
        output: PipeWriter,
    ) {
        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(cmd_id, error = %err, "accept failed");
                drop((input, output));
                self.reply_or_log(&Command::AcceptFailed {
                    cmd_id,
                    message: err.to_string(),
                });
                return;
            }
        };
        if self.closing.load(Ordering::SeqCst) || self.connection.is_terminated() {
            debug!(cmd_id, "executor closing; dropping accepted socket");
            return;
        }
        debug!(cmd_id, %peer, "connection accepted");
        self.reply_or_log(&Command::Accepted { cmd_id });

        if let Err(err) = relay_socket(cmd_id, socket, input, output) {
            debug!(cmd_id, error = %err, "socket relay ended with error");
        }
    }

    fn teardown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let listeners: Vec<_> = lock(&self.listeners).drain().collect();
        for (sock_id, listener) in listeners {
            // A pending accept holds its own reference; one connect wakes it.
            if let Ok(addr) = listener.local_addr() {
                let _ = TcpStream::connect(addr);
            }
            debug!(sock_id, "socket closed");
        }

        // Signalled under the lock: a listed pid has not been reaped yet.
        let mut processes = lock(&self.processes);
        for (proc_id, pid) in processes.drain() {
            info!(proc_id, pid, "terminating process");
            terminate_process(pid);
        }
    }
}

/// Copy one direction of a stream on its own thread.
fn spawn_pump<R, W>(name: String, mut from: R, mut to: W) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let result = spawn_named(name.clone(), move || {
        let result = io::copy(&mut from, &mut to).and_then(|n| to.flush().map(|()| n));
        match result {
            Ok(n) => debug!(pump = %name, bytes = n, "pump finished"),
            Err(err) => debug!(pump = %name, error = %err, "pump stopped"),
        }
    });
    match result {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!(error = %err, "cannot start pump thread");
            None
        }
    }
}

/// Records whether an output pump is parked in `read`, and since when.
#[derive(Default)]
struct ReadWatch(Mutex<Option<Instant>>);

impl ReadWatch {
    fn reading(&self) {
        *lock(&self.0) = Some(Instant::now());
    }

    fn writing(&self) {
        *lock(&self.0) = None;
    }

    /// Parked in `read` for at least `grace`, counting from `since` at the
    /// earliest.
    fn idle(&self, since: Instant, grace: Duration) -> bool {
        lock(&self.0).is_some_and(|parked| parked.max(since).elapsed() >= grace)
    }
}

/// A process output pump and the channel pipe it feeds.
struct OutputPump {
    handle: JoinHandle<()>,
    pipe: Pipe,
    watch: Arc<ReadWatch>,
}

/// Copy a process' stdout or stderr into its channel on its own thread.
fn spawn_output_pump<R>(name: String, mut from: R, mut to: PipeWriter) -> Option<OutputPump>
where
    R: Read + Send + 'static,
{
    let pipe = to.pipe().clone();
    let watch = Arc::new(ReadWatch::default());
    let reads = Arc::clone(&watch);
    let result = spawn_named(name.clone(), move || {
        let mut buf = [0u8; PUMP_CHUNK];
        let mut copied = 0u64;
        let result = loop {
            reads.reading();
            let n = match from.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(err),
            };
            reads.writing();
            if let Err(err) = to.write_all(&buf[..n]) {
                break Err(err);
            }
            copied += n as u64;
        };
        match result {
            Ok(()) => debug!(pump = %name, bytes = copied, "pump finished"),
            Err(err) => debug!(pump = %name, bytes = copied, error = %err, "pump stopped"),
        }
    });
    match result {
        Ok(handle) => Some(OutputPump {
            handle,
            pipe,
            watch,
        }),
        Err(err) => {
            error!(error = %err, "cannot start pump thread");
            None
        }
    }
}

/// Wait for output pumps to reach end-of-stream after the process exited.
///
/// Output the process wrote before exiting is already in the OS pipe, so a
/// pump still parked in `read` `grace` after `exited` is waiting on a
/// descendant that inherited the descriptor. Its channel is closed, which
/// sends end-of-stream after whatever was buffered, and the pump is left to
/// stop at its next write or at the descendant's exit. A pump busy writing
/// is always waited for.
fn drain_outputs(proc_id: i64, mut outputs: Vec<OutputPump>, exited: Instant, grace: Duration) {
    while !outputs.is_empty() {
        let mut running = Vec::with_capacity(outputs.len());
        for pump in outputs {
            if pump.handle.is_finished() {
                if pump.handle.join().is_err() {
                    warn!(proc_id, "stdio pump panicked");
                }
            } else if pump.watch.idle(exited, grace) {
                debug!(proc_id, "output still held open after exit; closing channel");
                pump.pipe.close_by_writer();
            } else {
                running.push(pump);
            }
        }
        outputs = running;
        if !outputs.is_empty() {
            thread::sleep(DRAIN_TICK);
        }
    }
}

/// Kill and reap a process nobody supervises.
fn kill_and_reap(proc_id: i64, mut child: Child) -> Option<ExitStatus> {
    if let Err(err) = child.kill() {
        debug!(proc_id, error = %err, "kill failed");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(proc_id, error = %err, "cannot reap process");
            None
        }
    }
}

/// Pump an accepted socket both ways until either side closes.
fn relay_socket(
    cmd_id: i64,
    socket: TcpStream,
    mut input: PipeReader,
    mut output: PipeWriter,
) -> io::Result<()> {
    let mut to_socket = socket.try_clone()?;
    let input_pipe = input.pipe().clone();

    let inbound = spawn_named(format!("chanmux-accept-{cmd_id}-in"), move || {
        let result = io::copy(&mut input, &mut to_socket);
        let _ = to_socket.shutdown(Shutdown::Write);
        result
    })
    .map_err(io::Error::other)?;

    let mut from_socket = socket.try_clone()?;
    let copied = io::copy(&mut from_socket, &mut output);
    drop(output);
    debug!(cmd_id, "remote client closed its side");

    // The client is gone: drop whatever the driver still sends.
    input_pipe.close_by_reader();
    let _ = socket.shutdown(Shutdown::Read);
    match inbound.join() {
        Ok(Ok(n)) => debug!(cmd_id, bytes = n, "driver side closed"),
        Ok(Err(err)) => debug!(cmd_id, error = %err, "socket write side stopped"),
        Err(_) => warn!(cmd_id, "socket pump panicked"),
    }
    copied.map(|_| ())
}

fn spawn_process(request: &ExecRequest) -> io::Result<Child> {
    let (program, args) = request
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !request.work_dir.is_empty() {
        command.current_dir(&request.work_dir);
    }
    for entry in &request.env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                command.env(key, value);
            }
            _ => warn!(
                proc_id = request.proc_id,
                entry = %entry,
                "ignoring env entry without KEY="
            ),
        }
    }
    command.spawn()
}

/// Exit code of a finished process; `128 + signal` when killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    EXIT_LAUNCH_FAILED
}

/// Block until `child` has exited, leaving it unreaped.
#[cfg(unix)]
fn wait_until_exited(child: &Child) -> io::Result<()> {
    let pid = libc::id_t::from(child.id());
    loop {
        // SAFETY: an all-zero siginfo_t is valid, and `info` outlives the call.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` points to a live, writable siginfo_t.
        let rc = unsafe {
            libc::waitid(libc::P_PID, pid, &mut info, libc::WEXITED | libc::WNOWAIT)
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn wait_until_exited(_child: &Child) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn terminate_process(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %io::Error::last_os_error(), "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn terminate_process(pid: u32) {
    debug!(pid, "process left running; no signal support on this platform");
}
