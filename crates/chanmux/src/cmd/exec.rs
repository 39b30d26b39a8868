use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chanmux_remote::{Driver, ExecEvent};
use tracing::{debug, warn};

use crate::cmd::{bootstrap, install_ctrlc_handler, Context, ExecArgs, INTERRUPT_POLL};
use crate::exit::{remote_error, CliError, CliResult, FAILURE, TRANSPORT_ERROR};

pub fn run(args: ExecArgs, ctx: &Context) -> CliResult<i32> {
    let stream = bootstrap(&args.bootstrap, ctx)?;
    let driver = Driver::connect(stream, ctx.config.clone())
        .map_err(|err| remote_error("connection failed", err))?;
    let running = install_ctrlc_handler()?;

    let (tx, rx) = mpsc::channel();
    driver
        .exec(args.workdir, args.argv, args.env, Arc::new(tx))
        .map_err(|err| remote_error("exec request failed", err))?;

    let mut relays: Vec<JoinHandle<()>> = Vec::new();
    let code = loop {
        let event = match rx.recv_timeout(INTERRUPT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    debug!("interrupted; shutting down");
                    driver.shutdown();
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                driver.shutdown();
                return Err(CliError::new(TRANSPORT_ERROR, "connection lost"));
            }
        };
        match event {
            ExecEvent::Started {
                stdin,
                stdout,
                stderr,
            } => {
                // Local stdin may block forever; that relay is never joined.
                let _ = relay("chanmux-stdin", io::stdin(), stdin);
                relays.extend(relay("chanmux-stdout", stdout, io::stdout()));
                relays.extend(relay("chanmux-stderr", stderr, io::stderr()));
            }
            ExecEvent::LaunchFailed(message) => {
                eprintln!("error: {message}");
            }
            ExecEvent::Finished(code) => break code,
        }
    };

    // Output may still be in flight after the exit code.
    for handle in relays {
        let _ = handle.join();
    }
    driver.shutdown();

    if code < 0 {
        return Ok(FAILURE);
    }
    Ok(code)
}

fn relay<R, W>(name: &str, mut from: R, mut to: W) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let label = name.to_string();
    let spawned = thread::Builder::new()
        .name(label.clone())
        .spawn(move || {
            match io::copy(&mut from, &mut to).and_then(|n| to.flush().map(|()| n)) {
                Ok(bytes) => debug!(relay = %label, bytes, "relay finished"),
                Err(err) => debug!(relay = %label, error = %err, "relay stopped"),
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(relay = name, error = %err, "cannot start relay thread");
            None
        }
    }
}
