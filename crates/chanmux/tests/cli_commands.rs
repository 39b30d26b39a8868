#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

fn chanmux() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_chanmux"));
    command.arg("--log-level").arg("error");
    command
}

#[test]
fn exec_relays_stdout_and_exits_zero() {
    let output = chanmux()
        .args(["exec", "--", "echo", "hi"])
        .stdin(Stdio::null())
        .output()
        .expect("exec should run");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hi\n");
}

#[test]
fn exec_propagates_remote_exit_code() {
    let output = chanmux()
        .args(["exec", "--", "sh", "-c", "echo bad >&2; exit 7"])
        .stdin(Stdio::null())
        .output()
        .expect("exec should run");

    assert_eq!(output.status.code(), Some(7));
    assert!(String::from_utf8_lossy(&output.stderr).contains("bad"));
}

#[test]
fn exec_of_missing_program_exits_one() {
    let output = chanmux()
        .args(["exec", "--", "/nonexistent/chanmux-cli-test"])
        .stdin(Stdio::null())
        .output()
        .expect("exec should run");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot launch"));
}

#[test]
fn exec_relays_stdin_until_eof() {
    let mut child = chanmux()
        .args(["exec", "--", "cat"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("exec should start");

    let mut stdin = child.stdin.take().expect("stdin should be piped");
    stdin
        .write_all(b"through the tunnel\n")
        .expect("stdin should accept bytes");
    drop(stdin);

    let output = child.wait_with_output().expect("exec should finish");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "through the tunnel\n"
    );
}

#[test]
fn exec_passes_env_and_workdir() {
    let dir = std::env::temp_dir()
        .canonicalize()
        .expect("temp dir should resolve");
    let dir = dir.to_str().expect("temp dir should be utf-8");

    let output = chanmux()
        .args([
            "exec",
            "--workdir",
            dir,
            "--env",
            "CHANMUX_CLI_VALUE=set",
            "--",
            "sh",
            "-c",
            "echo \"$CHANMUX_CLI_VALUE\"; pwd -P",
        ])
        .stdin(Stdio::null())
        .output()
        .expect("exec should run");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        format!("set\n{dir}\n")
    );
}

#[test]
fn forward_relays_remote_connections_to_target() {
    let target = TcpListener::bind("127.0.0.1:0").expect("target should bind");
    let target_addr = target.local_addr().expect("target should have address");
    let echo = thread::spawn(move || {
        for _ in 0..2 {
            let (conn, _) = target.accept().expect("target should accept");
            let mut reader = BufReader::new(conn.try_clone().expect("target should clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("target should read");
            (&conn).write_all(line.as_bytes()).expect("target should echo");
        }
    });

    let mut child = chanmux()
        .args(["--format", "json", "forward", "--target"])
        .arg(target_addr.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .expect("forward should start");
    let mut events = BufReader::new(child.stdout.take().expect("stdout should be piped"));

    let mut line = String::new();
    events.read_line(&mut line).expect("bound event should print");
    let bound: serde_json::Value = serde_json::from_str(&line).expect("event should be json");
    assert_eq!(bound["event"], "bound");
    let port = bound["port"].as_u64().expect("port should be numeric") as u16;

    for round in 0..2 {
        let mut client =
            TcpStream::connect(("127.0.0.1", port)).expect("client should reach forwarded port");
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("timeout should apply");
        let message = format!("payload {round}\n");
        client
            .write_all(message.as_bytes())
            .expect("client should write");
        let mut echoed = String::new();
        client
            .read_to_string(&mut echoed)
            .expect("client should read echo");
        assert_eq!(echoed, message);
    }

    echo.join().expect("echo target should not panic");
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn version_prints_package_version() {
    let output = chanmux()
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}
