//! End-to-end handoff through the `baton` binary.
//!
//! A running generation gets SIGHUP while a client keeps connecting and an
//! event stream stays open. The successor must pick up the shared socket
//! without a single refused connection.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Kills whatever generations are still around when the test ends
struct Generations {
    first: Child,
    successor: Option<i32>,
}

impl Drop for Generations {
    fn drop(&mut self) {
        let _ = self.first.kill();
        let _ = self.first.wait();
        if let Some(pid) = self.successor {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }
}

fn reserve_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn spawn_baton(addr: SocketAddr, pid_file: &Path) -> Child {
    let mut command = Command::new(env!("CARGO_BIN_EXE_baton"));
    for (key, _) in std::env::vars() {
        if key.starts_with("BATON_") {
            command.env_remove(key);
        }
    }
    command
        .arg("--listen")
        .arg(format!("http={addr}"))
        .arg("--pid-file")
        .arg(pid_file)
        .args(["--drain-grace-secs", "2"])
        .args(["--hard-exit-secs", "5"])
        .args(["--readiness-timeout-secs", "10"])
        .args(["--stream-interval-ms", "50"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn wait_for_pid(path: &Path, pid: i32) {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while read_pid(path) != Some(pid) {
        assert!(Instant::now() < deadline, "pid file never named {pid}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

/// Open `/ping` and collect event ids until the server closes the stream
fn open_stream(addr: SocketAddr) -> thread::JoinHandle<Vec<u64>> {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(stream, "GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

    thread::spawn(move || {
        let reader = BufReader::new(stream);
        let mut ids = Vec::new();
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Some(id) = line.strip_prefix("id:") {
                ids.push(id.trim().parse().unwrap());
            }
        }
        ids
    })
}

/// Connect over and over until `stop` is set; returns (attempts, failures)
fn hammer(addr: SocketAddr, stop: Arc<AtomicBool>) -> thread::JoinHandle<(usize, usize)> {
    thread::spawn(move || {
        let (mut attempts, mut failures) = (0, 0);
        while !stop.load(Ordering::Relaxed) {
            attempts += 1;
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    let _ = write!(
                        stream,
                        "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
                    );
                    let _ = stream.read_to_end(&mut Vec::new());
                }
                Err(_) => failures += 1,
            }
        }
        (attempts, failures)
    })
}

fn wait_exit(child: &mut Child) -> i32 {
    let deadline = Instant::now() + EXIT_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status.code().expect("predecessor killed by a signal");
        }
        assert!(Instant::now() < deadline, "predecessor did not exit");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_sighup_hands_off_without_refusing_connections() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("baton.pid");
    let addr = reserve_port();

    let mut generations = Generations {
        first: spawn_baton(addr, &pid_file),
        successor: None,
    };
    let first_pid = generations.first.id() as i32;
    wait_for_pid(&pid_file, first_pid);
    assert!(get(addr, "/").contains("x-baton-generation: 1"));

    let events = open_stream(addr);
    let stop = Arc::new(AtomicBool::new(false));
    let connector = hammer(addr, Arc::clone(&stop));
    thread::sleep(Duration::from_millis(300));

    kill(Pid::from_raw(first_pid), Signal::SIGHUP).unwrap();

    let code = wait_exit(&mut generations.first);
    assert!(code == 0 || code == 2, "predecessor exited with {code}");
    let successor = read_pid(&pid_file).unwrap();
    generations.successor = Some(successor);

    thread::sleep(Duration::from_millis(200));
    stop.store(true, Ordering::Relaxed);
    let (attempts, failures) = connector.join().unwrap();
    assert!(attempts > 0);
    assert_eq!(failures, 0, "{failures} of {attempts} connects refused");

    let ids = events.join().unwrap();
    assert!(!ids.is_empty());
    let expected: Vec<u64> = (1..=ids.len() as u64).collect();
    assert_eq!(ids, expected);

    assert_ne!(successor, first_pid);
    assert!(kill(Pid::from_raw(successor), None).is_ok());
    assert!(get(addr, "/").contains("x-baton-generation: 2"));
}
