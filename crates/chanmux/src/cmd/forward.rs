use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use chanmux_remote::{Driver, SocketEvent};
use chanmux_transport::{PipeReader, PipeWriter};
use tracing::{debug, info, warn};

use crate::cmd::{bootstrap, install_ctrlc_handler, Context, ForwardArgs, INTERRUPT_POLL};
use crate::exit::{remote_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_event, ForwardEvent};

pub fn run(args: ForwardArgs, ctx: &Context) -> CliResult<i32> {
    let stream = bootstrap(&args.bootstrap, ctx)?;
    let driver = Driver::connect(stream, ctx.config.clone())
        .map_err(|err| remote_error("connection failed", err))?;
    let running = install_ctrlc_handler()?;

    let (tx, rx) = mpsc::channel();
    driver
        .new_socket(Arc::new(tx))
        .map_err(|err| remote_error("bind request failed", err))?;

    let mut accepted = 0u64;
    loop {
        let event = match rx.recv_timeout(INTERRUPT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    info!("interrupted; shutting down");
                    driver.shutdown();
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match event {
            SocketEvent::Bound { host, port } => {
                print_event(&ForwardEvent::Bound { host: &host, port }, ctx.format);
            }
            SocketEvent::Accepted { input, output } => {
                accepted += 1;
                print_event(
                    &ForwardEvent::Accepted {
                        connection: accepted,
                        target: &args.target,
                    },
                    ctx.format,
                );
                let target = args.target.clone();
                let format = ctx.format;
                let connection = accepted;
                let spawned = thread::Builder::new()
                    .name(format!("chanmux-forward-{connection}"))
                    .spawn(move || {
                        if let Err(err) = forward_one(&target, input, output) {
                            warn!(connection, target = %target, error = %err, "forwarding failed");
                        }
                        print_event(&ForwardEvent::Closed { connection }, format);
                    });
                if let Err(err) = spawned {
                    warn!(connection, error = %err, "cannot start forwarding thread");
                }
            }
            SocketEvent::Terminated(message) => {
                print_event(&ForwardEvent::Terminated { message: &message }, ctx.format);
                driver.shutdown();
                return Ok(if running.load(Ordering::SeqCst) {
                    FAILURE
                } else {
                    SUCCESS
                });
            }
        }
    }

    driver.shutdown();
    Ok(FAILURE)
}

/// Relay one accepted remote connection to a fresh local connection.
fn forward_one(target: &str, mut input: PipeReader, mut output: PipeWriter) -> io::Result<()> {
    let local = TcpStream::connect(target)?;
    let mut to_local = local.try_clone()?;
    let mut from_local = local.try_clone()?;
    let input_pipe = input.pipe().clone();

    let upstream = thread::Builder::new()
        .name("chanmux-forward-up".to_string())
        .spawn(move || {
            let copied = io::copy(&mut input, &mut to_local);
            let _ = to_local.shutdown(Shutdown::Write);
            copied
        })?;

    let downstream = io::copy(&mut from_local, &mut output);
    drop(output);
    // The target is gone: stop relaying the remote client's bytes.
    input_pipe.close_by_reader();
    let _ = local.shutdown(Shutdown::Both);

    match upstream.join() {
        Ok(Ok(bytes)) => debug!(bytes, "remote client finished sending"),
        Ok(Err(err)) => debug!(error = %err, "upstream relay stopped"),
        Err(_) => warn!("upstream relay panicked"),
    }
    downstream.map(|bytes| debug!(bytes, "local target finished sending"))
}
