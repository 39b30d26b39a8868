use std::process::{Command as OsCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chanmux_remote::ConnectionConfig;
use chanmux_transport::DuplexStream;
use clap::{Args, Subcommand};
use tracing::debug;

use crate::exit::{io_error, transport_error, CliError, CliResult, INTERNAL};
use crate::logging::LogLevel;
use crate::output::OutputFormat;

pub mod exec;
pub mod forward;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute commands arriving on stdin/stdout (the remote end).
    Serve(ServeArgs),
    /// Run a command on the remote end and relay its stdio.
    Exec(ExecArgs),
    /// Listen on the remote loopback and relay connections to a local target.
    Forward(ForwardArgs),
    /// Show version information.
    Version(VersionArgs),
}

/// Settings shared by every subcommand that opens a connection.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: ConnectionConfig,
    pub format: OutputFormat,
    pub log_level: LogLevel,
}

pub fn run(command: Command, ctx: &Context) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, ctx),
        Command::Exec(args) => exec::run(args, ctx),
        Command::Forward(args) => forward::run(args, ctx),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {}

/// How the remote end is reached.
#[derive(Args, Debug, Default, Clone)]
pub struct BootstrapArgs {
    /// Shell command whose stdin/stdout reach a `chanmux serve` (e.g.
    /// `ssh host chanmux serve`). Default: run `serve` from this binary
    /// locally.
    #[arg(long, value_name = "CMD")]
    pub bootstrap: Option<String>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub bootstrap: BootstrapArgs,
    /// Working directory on the remote end.
    #[arg(long, value_name = "DIR", default_value = "")]
    pub workdir: String,
    /// Extra environment entry for the remote process (repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
    /// Program and arguments.
    #[arg(required = true, last = true, value_name = "ARGV")]
    pub argv: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ForwardArgs {
    #[command(flatten)]
    pub bootstrap: BootstrapArgs,
    /// Local address every accepted remote connection is relayed to.
    #[arg(long, value_name = "HOST:PORT")]
    pub target: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}

/// Start the bootstrap process and wrap its stdio as the physical stream.
///
/// Connection settings are forwarded through the environment so a
/// `chanmux serve` on the other end frames with the same limits.
pub fn bootstrap(args: &BootstrapArgs, ctx: &Context) -> CliResult<DuplexStream> {
    let mut command = match &args.bootstrap {
        Some(shell) => {
            let mut command = OsCommand::new("sh");
            command.arg("-c").arg(shell);
            command
        }
        None => {
            let exe = std::env::current_exe()
                .map_err(|err| io_error("cannot locate chanmux binary", err))?;
            let mut command = OsCommand::new(exe);
            command
                .arg("--log-level")
                .arg(ctx.log_level.as_arg())
                .arg("serve");
            command
        }
    };
    command
        .env("CHANMUX_PIPE_CAPACITY", ctx.config.pipe_capacity.to_string())
        .env("CHANMUX_MAX_FRAME", ctx.config.max_frame_payload.to_string())
        .env(
            "CHANMUX_POLL_INTERVAL_MS",
            ctx.config.mux_poll_interval.as_millis().to_string(),
        )
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    debug!(command = ?command, "starting bootstrap");
    let child = command
        .spawn()
        .map_err(|err| io_error("bootstrap failed to start", err))?;
    DuplexStream::from_child(child).map_err(|err| transport_error("bootstrap stdio", err))
}

/// Flag flipped by Ctrl-C.
pub fn install_ctrlc_handler() -> CliResult<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;
    Ok(running)
}

/// How often foreground loops check the Ctrl-C flag.
pub const INTERRUPT_POLL: Duration = Duration::from_millis(200);
