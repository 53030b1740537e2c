// Integration tests for the line-relay binary
// Run with: cargo test --test cli

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn relay() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_line-relay"));
    command.env_remove("RUST_LOG");
    command
}

fn run(args: &[&str]) -> Output {
    relay()
        .args(args)
        .output()
        .expect("Failed to execute line-relay")
}

fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("relay never started listening: {e}"),
        }
    }
}

#[test]
fn test_no_arguments() {
    let output = run(&[]);

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(
        String::from_utf8_lossy(&output.stderr),
        "Wrong number of arguments\n"
    );
    assert!(output.stdout.is_empty());
}

#[test]
fn test_extra_argument() {
    let output = run(&["9000", "9001"]);

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(
        String::from_utf8_lossy(&output.stderr),
        "Wrong number of arguments\n"
    );
}

#[test]
fn test_port_in_use_prints_one_line() {
    let held = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port().to_string();

    let output = run(&[&port]);

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(String::from_utf8_lossy(&output.stderr), "Fatal error\n");
    drop(held);
}

#[test]
fn test_relays_between_clients_quietly() {
    let port = {
        let free = TcpListener::bind("127.0.0.1:0").unwrap();
        free.local_addr().unwrap().port()
    };

    let mut child = relay()
        .arg(port.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn line-relay");

    let x = connect_with_retry(port);
    let mut y = connect_with_retry(port);
    let mut x = BufReader::new(x);

    let mut line = String::new();
    x.read_line(&mut line).unwrap();
    assert_eq!(line, "server: client 1 just arrived\n");

    y.write_all(b"hello\n").unwrap();
    line.clear();
    x.read_line(&mut line).unwrap();
    assert_eq!(line, "client 1: hello\n");

    child.kill().unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(
        output.stderr.is_empty(),
        "unexpected stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
