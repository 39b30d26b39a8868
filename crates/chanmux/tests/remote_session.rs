#![cfg(unix)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chanmux::frame::{REPLY, REQUEST};
use chanmux::remote::{Command, CommandReader, CommandWriter};
use chanmux::{
    Connection, ConnectionConfig, Driver, DuplexStream, ExecEvent, Executor, PipeReader,
    PipeWriter, SocketEvent,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> ConnectionConfig {
    ConnectionConfig::default().with_mux_poll_interval(Duration::from_millis(10))
}

/// A driver wired to an executor running on a background thread.
fn session() -> (Driver, Connection, JoinHandle<()>) {
    let (near, far) = UnixStream::pair().expect("socket pair should open");
    let executor = Executor::start(
        DuplexStream::from_unix(far).expect("far end should wrap"),
        test_config(),
    )
    .expect("executor should start");
    let executor_connection = executor.connection().clone();
    let serving = thread::spawn(move || {
        let _ = executor.run();
    });
    let driver = Driver::connect(
        DuplexStream::from_unix(near).expect("near end should wrap"),
        test_config(),
    )
    .expect("driver should connect");
    (driver, executor_connection, serving)
}

fn close(driver: Driver, executor: Connection, serving: JoinHandle<()>) {
    driver.shutdown();
    executor.shutdown();
    serving.join().expect("executor thread should not panic");
}

/// A driver whose peer answers control commands by hand.
fn driver_with_scripted_peer() -> (
    Driver,
    Connection,
    CommandReader<PipeReader>,
    CommandWriter<PipeWriter>,
) {
    let (near, far) = UnixStream::pair().expect("socket pair should open");
    let (peer, (requests, replies)) = Connection::start_with(
        DuplexStream::from_unix(far).expect("far end should wrap"),
        test_config(),
        |registry| Ok((registry.open_inbound(REQUEST)?, registry.open_outbound(REPLY)?)),
    )
    .expect("peer should start");
    let driver = Driver::connect(
        DuplexStream::from_unix(near).expect("near end should wrap"),
        test_config(),
    )
    .expect("driver should connect");
    (
        driver,
        peer,
        CommandReader::new(requests),
        CommandWriter::new(replies),
    )
}

/// An executor whose peer sends control commands by hand.
fn executor_with_scripted_peer() -> (
    Connection,
    JoinHandle<()>,
    Connection,
    CommandWriter<PipeWriter>,
    CommandReader<PipeReader>,
) {
    let (near, far) = UnixStream::pair().expect("socket pair should open");
    let executor = Executor::start(
        DuplexStream::from_unix(far).expect("far end should wrap"),
        test_config(),
    )
    .expect("executor should start");
    let executor_connection = executor.connection().clone();
    let serving = thread::spawn(move || {
        let _ = executor.run();
    });
    let (peer, (requests, replies)) = Connection::start_with(
        DuplexStream::from_unix(near).expect("near end should wrap"),
        test_config(),
        |registry| Ok((registry.open_outbound(REQUEST)?, registry.open_inbound(REPLY)?)),
    )
    .expect("peer should start");
    (
        executor_connection,
        serving,
        peer,
        CommandWriter::new(requests),
        CommandReader::new(replies),
    )
}

fn next_command(reader: &mut CommandReader<PipeReader>) -> Command {
    reader
        .read_command()
        .expect("control channel should stay readable")
        .expect("a command should arrive")
}

/// Commands still arriving before the channel ends.
fn remaining_commands(mut reader: CommandReader<PipeReader>) -> Vec<Command> {
    let mut commands = Vec::new();
    while let Ok(Some(command)) = reader.read_command() {
        commands.push(command);
    }
    commands
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn next<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(EVENT_TIMEOUT)
        .expect("event should arrive in time")
}

fn read_all(mut reader: PipeReader) -> String {
    let mut out = String::new();
    reader
        .read_to_string(&mut out)
        .expect("channel should read to end");
    out
}

struct Run {
    stdin: PipeWriter,
    stdout: PipeReader,
    stderr: PipeReader,
    rx: Receiver<ExecEvent>,
}

fn start(driver: &Driver, work_dir: &str, args: &[&str], env: &[&str]) -> Run {
    let (tx, rx) = mpsc::channel();
    driver
        .exec(work_dir, argv(args), argv(env), Arc::new(tx))
        .expect("exec should be sent");
    match next(&rx) {
        ExecEvent::Started {
            stdin,
            stdout,
            stderr,
        } => Run {
            stdin,
            stdout,
            stderr,
            rx,
        },
        other => panic!("expected started, got {other:?}"),
    }
}

fn finished(rx: &Receiver<ExecEvent>) -> i32 {
    match next(rx) {
        ExecEvent::Finished(code) => code,
        other => panic!("expected finished, got {other:?}"),
    }
}

#[test]
fn echo_reports_started_output_and_exit_code() {
    let (driver, executor, serving) = session();

    let run = start(&driver, "", &["echo", "hi"], &[]);
    drop(run.stdin);
    assert_eq!(read_all(run.stdout), "hi\n");
    assert_eq!(read_all(run.stderr), "");
    assert_eq!(finished(&run.rx), 0);

    close(driver, executor, serving);
}

#[test]
fn nonzero_exit_code_is_reported() {
    let (driver, executor, serving) = session();

    let run = start(&driver, "", &["sh", "-c", "echo oops >&2; exit 7"], &[]);
    assert_eq!(read_all(run.stderr), "oops\n");
    assert_eq!(finished(&run.rx), 7);

    close(driver, executor, serving);
}

#[test]
fn missing_program_fails_launch_without_started() {
    let (driver, executor, serving) = session();

    let (tx, rx) = mpsc::channel();
    driver
        .exec(
            "",
            argv(&["/nonexistent/chanmux-test-binary"]),
            Vec::new(),
            Arc::new(tx),
        )
        .expect("exec should be sent");

    match next(&rx) {
        ExecEvent::LaunchFailed(message) => {
            assert!(message.contains("cannot launch"), "message: {message}")
        }
        other => panic!("expected launch failure, got {other:?}"),
    }
    assert_eq!(finished(&rx), -1);

    close(driver, executor, serving);
}

#[test]
fn stdin_is_relayed_and_closing_it_ends_the_process() {
    let (driver, executor, serving) = session();

    let mut run = start(&driver, "", &["cat"], &[]);
    run.stdin
        .write_all(b"line one\nline two\n")
        .expect("stdin should accept bytes");
    drop(run.stdin);
    assert_eq!(read_all(run.stdout), "line one\nline two\n");
    assert_eq!(finished(&run.rx), 0);

    close(driver, executor, serving);
}

#[test]
fn env_and_workdir_apply_to_the_process() {
    let (driver, executor, serving) = session();
    let dir = std::env::temp_dir()
        .canonicalize()
        .expect("temp dir should resolve");
    let dir = dir.to_str().expect("temp dir should be utf-8");

    let run = start(
        &driver,
        dir,
        &["sh", "-c", "printf '%s\\n' \"$CHANMUX_TEST_VALUE\"; pwd -P"],
        &["CHANMUX_TEST_VALUE=layered", "MALFORMED_ENTRY"],
    );
    assert_eq!(read_all(run.stdout), format!("layered\n{dir}\n"));
    assert_eq!(finished(&run.rx), 0);

    close(driver, executor, serving);
}

#[test]
fn background_descendant_does_not_delay_finished() {
    let (driver, executor, serving) = session();

    let begun = Instant::now();
    let run = start(&driver, "", &["sh", "-c", "sleep 4 & echo hi"], &[]);
    drop(run.stdin);
    assert_eq!(finished(&run.rx), 0);
    assert!(
        begun.elapsed() < Duration::from_secs(2),
        "finished took {:?}",
        begun.elapsed()
    );
    assert_eq!(read_all(run.stdout), "hi\n");
    assert_eq!(read_all(run.stderr), "");

    close(driver, executor, serving);
}

#[test]
fn concurrent_execs_keep_their_output_apart() {
    let (driver, executor, serving) = session();

    let runs: Vec<_> = (0..4)
        .map(|n| {
            let script = format!("for i in 1 2 3 4 5; do echo {n}-$i; done");
            start(&driver, "", &["sh", "-c", &script], &[])
        })
        .collect();

    for (n, run) in runs.into_iter().enumerate() {
        let expected: String = (1..=5).map(|i| format!("{n}-{i}\n")).collect();
        assert_eq!(read_all(run.stdout), expected);
        assert_eq!(finished(&run.rx), 0);
    }

    close(driver, executor, serving);
}

#[test]
fn a_busy_channel_does_not_starve_a_quiet_one() {
    let (driver, executor, serving) = session();

    let busy = start(&driver, "", &["yes", "chanmux"], &[]);
    let mut busy_out = busy.stdout;
    let drain = thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut total = 0usize;
        while let Ok(n) = busy_out.read(&mut buf) {
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    });

    // Let the busy channel saturate the link first.
    thread::sleep(Duration::from_millis(200));
    let began = Instant::now();
    let quiet = start(&driver, "", &["printf", "x"], &[]);
    assert_eq!(read_all(quiet.stdout), "x");
    assert_eq!(finished(&quiet.rx), 0);
    assert!(began.elapsed() < Duration::from_secs(5));

    close(driver, executor, serving);
    let total = drain.join().expect("drain thread should not panic");
    assert!(total > 0);
}

#[test]
fn socket_accepts_successive_connections() {
    let (driver, executor, serving) = session();

    let (tx, rx) = mpsc::channel();
    driver
        .new_socket(Arc::new(tx))
        .expect("bind should be sent");
    let port = match next(&rx) {
        SocketEvent::Bound { host, port } => {
            assert_eq!(host, "127.0.0.1");
            assert_ne!(port, 0);
            port
        }
        other => panic!("expected bound, got {other:?}"),
    };

    for round in 0..3 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).expect("client should connect");
        let (mut input, mut output) = match next(&rx) {
            SocketEvent::Accepted { input, output } => (input, output),
            other => panic!("expected accepted, got {other:?}"),
        };

        let request = format!("request {round}");
        client
            .write_all(request.as_bytes())
            .expect("client should write");
        let mut got = vec![0u8; request.len()];
        input.read_exact(&mut got).expect("request should arrive");
        assert_eq!(got, request.as_bytes());

        let response = format!("response {round}");
        output
            .write_all(response.as_bytes())
            .expect("response should be accepted");
        drop(output);
        let mut got = String::new();
        client
            .read_to_string(&mut got)
            .expect("client should read to end");
        assert_eq!(got, response);

        drop(client);
        assert_eq!(read_all(input), "");
    }

    close(driver, executor, serving);
    match next(&rx) {
        SocketEvent::Terminated(message) => assert_eq!(message, "connection terminated"),
        other => panic!("expected terminated, got {other:?}"),
    }
}

#[test]
fn losing_the_connection_settles_pending_work() {
    let (driver, executor, serving) = session();

    let run = start(&driver, "", &["sleep", "30"], &[]);
    let (tx, socket_rx) = mpsc::channel();
    driver
        .new_socket(Arc::new(tx))
        .expect("bind should be sent");
    assert!(matches!(next(&socket_rx), SocketEvent::Bound { .. }));

    executor.shutdown();
    serving.join().expect("executor thread should not panic");

    assert_eq!(finished(&run.rx), -1);
    match next(&socket_rx) {
        SocketEvent::Terminated(message) => assert_eq!(message, "connection terminated"),
        other => panic!("expected terminated, got {other:?}"),
    }
    assert!(driver.connection().wait_terminated_timeout(EVENT_TIMEOUT));
    assert!(driver.is_terminated());
    driver.shutdown();
}

#[test]
fn failed_accepts_are_answered_and_release_their_channels() {
    let (executor, serving, peer, mut requests, mut replies) = executor_with_scripted_peer();

    requests
        .send(&Command::Accept {
            sock_id: 99,
            cmd_id: 1,
            to_remote: 5,
            from_remote: 6,
        })
        .expect("accept should be sent");
    match next_command(&mut replies) {
        Command::AcceptFailed { cmd_id, message } => {
            assert_eq!(cmd_id, 1);
            assert!(message.contains("99"), "message: {message}");
        }
        other => panic!("expected accept failure, got {other:?}"),
    }
    assert!(!executor.registry().contains(5));
    assert!(!executor.registry().contains(6));

    requests
        .send(&Command::Bind { sock_id: 1 })
        .expect("bind should be sent");
    assert!(matches!(
        next_command(&mut replies),
        Command::Bound { sock_id: 1, .. }
    ));
    // The same id for both directions fails after the first one opened.
    requests
        .send(&Command::Accept {
            sock_id: 1,
            cmd_id: 2,
            to_remote: 7,
            from_remote: 7,
        })
        .expect("accept should be sent");
    assert!(matches!(
        next_command(&mut replies),
        Command::AcceptFailed { cmd_id: 2, .. }
    ));
    assert!(!executor.registry().contains(7));

    drop(requests);
    serving.join().expect("executor thread should not panic");
    executor.shutdown();
    peer.shutdown();
}

#[test]
fn bind_failure_terminates_the_socket_once() {
    let (driver, peer, mut requests, mut replies) = driver_with_scripted_peer();

    let (tx, rx) = mpsc::channel();
    let sock_id = driver
        .new_socket(Arc::new(tx))
        .expect("bind should be sent");
    assert_eq!(next_command(&mut requests), Command::Bind { sock_id });
    replies
        .send(&Command::BindFailed {
            sock_id,
            message: "address in use".to_string(),
        })
        .expect("reply should be sent");

    match next(&rx) {
        SocketEvent::Terminated(message) => assert_eq!(message, "address in use"),
        other => panic!("expected terminated, got {other:?}"),
    }

    driver.shutdown();
    assert!(rx.recv().is_err(), "no event may follow termination");
    let leftover = remaining_commands(requests);
    assert!(leftover.is_empty(), "unexpected commands: {leftover:?}");
    peer.shutdown();
}

#[test]
fn accept_failure_terminates_the_socket_without_rearming() {
    let (driver, peer, mut requests, mut replies) = driver_with_scripted_peer();

    let (tx, rx) = mpsc::channel();
    let sock_id = driver
        .new_socket(Arc::new(tx))
        .expect("bind should be sent");
    assert_eq!(next_command(&mut requests), Command::Bind { sock_id });
    replies
        .send(&Command::Bound {
            sock_id,
            host: "127.0.0.1".to_string(),
            port: 4000,
        })
        .expect("reply should be sent");
    assert!(matches!(next(&rx), SocketEvent::Bound { port: 4000, .. }));

    let cmd_id = match next_command(&mut requests) {
        Command::Accept {
            sock_id: accepted,
            cmd_id,
            ..
        } => {
            assert_eq!(accepted, sock_id);
            cmd_id
        }
        other => panic!("expected accept, got {other:?}"),
    };
    replies
        .send(&Command::AcceptFailed {
            cmd_id,
            message: "too many open files".to_string(),
        })
        .expect("reply should be sent");

    match next(&rx) {
        SocketEvent::Terminated(message) => assert_eq!(message, "too many open files"),
        other => panic!("expected terminated, got {other:?}"),
    }

    driver.shutdown();
    assert!(rx.recv().is_err(), "no event may follow termination");
    let leftover = remaining_commands(requests);
    assert!(leftover.is_empty(), "unexpected commands: {leftover:?}");
    peer.shutdown();
}
