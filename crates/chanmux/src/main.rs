mod cmd;
mod exit;
mod logging;
mod output;

use std::time::Duration;

use chanmux_remote::ConnectionConfig;
use clap::Parser;

use crate::cmd::{Command, Context};
use crate::exit::{remote_error, USAGE};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "chanmux",
    version,
    about = "Remote process execution and socket forwarding over one byte stream"
)]
struct Cli {
    /// Output format for reported events.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Capacity of every channel pipe, in bytes.
    #[arg(
        long,
        env = "CHANMUX_PIPE_CAPACITY",
        default_value_t = chanmux_transport::DEFAULT_PIPE_CAPACITY,
        global = true
    )]
    pipe_capacity: usize,

    /// Largest frame payload, in bytes. At most half the pipe capacity.
    #[arg(
        long = "max-frame",
        env = "CHANMUX_MAX_FRAME",
        default_value_t = chanmux_frame::DEFAULT_MAX_PAYLOAD,
        global = true
    )]
    max_frame: usize,

    /// Longest multiplexer sleep between scans, in milliseconds.
    #[arg(long, env = "CHANMUX_POLL_INTERVAL_MS", default_value_t = 100, global = true)]
    poll_interval_ms: u64,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .with_pipe_capacity(self.pipe_capacity)
            .with_max_frame_payload(self.max_frame)
            .with_mux_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let config = cli.connection_config();
    if let Err(err) = config.validate() {
        let err = remote_error("invalid connection settings", err);
        eprintln!("error: {err}");
        std::process::exit(USAGE);
    }

    let ctx = Context {
        config,
        format: cli.format.unwrap_or_else(OutputFormat::default_for_stdout),
        log_level: cli.log_level,
    };
    let result = cmd::run(cli.command, &ctx);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exec_with_trailing_argv() {
        let cli = Cli::try_parse_from([
            "chanmux",
            "exec",
            "--workdir",
            "/tmp",
            "--env",
            "A=1",
            "--",
            "ls",
            "-l",
        ])
        .expect("exec args should parse");

        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.workdir, "/tmp");
        assert_eq!(args.env, vec!["A=1"]);
        assert_eq!(args.argv, vec!["ls", "-l"]);
        assert!(args.bootstrap.bootstrap.is_none());
    }

    #[test]
    fn exec_requires_argv() {
        let err = Cli::try_parse_from(["chanmux", "exec"]).expect_err("argv is required");
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn forward_requires_target() {
        let cli = Cli::try_parse_from([
            "chanmux",
            "forward",
            "--target",
            "127.0.0.1:8080",
            "--bootstrap",
            "ssh host chanmux serve",
        ])
        .expect("forward args should parse");
        let Command::Forward(args) = cli.command else {
            panic!("expected forward");
        };
        assert_eq!(args.target, "127.0.0.1:8080");
        assert_eq!(
            args.bootstrap.bootstrap.as_deref(),
            Some("ssh host chanmux serve")
        );
    }

    #[test]
    fn global_connection_flags_build_config() {
        let cli = Cli::try_parse_from([
            "chanmux",
            "--pipe-capacity",
            "8192",
            "--max-frame",
            "4096",
            "--poll-interval-ms",
            "5",
            "serve",
        ])
        .expect("serve args should parse");
        let config = cli.connection_config();
        assert_eq!(config.pipe_capacity, 8192);
        assert_eq!(config.max_frame_payload, 4096);
        assert_eq!(config.mux_poll_interval, Duration::from_millis(5));
        config.validate().expect("config should be valid");
    }
}
