//! End-to-end scenarios driving `Backend` against a real loopback
//! `TcpListener` standing in for the cache peer.
//!
//! These poll the backend's raw fd with `libc::poll` between steps rather
//! than running a full `EventThread`, so a scenario only calls
//! `on_writable`/`on_readable` once the kernel actually reports the
//! socket ready — matching what the readiness driver would deliver.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::cacheback::backend::{Backend, BackendFailureKind, BackendState, CompletionSink, Request, RequestStatus};
use crate::cacheback::config::BackendEndpoint;

struct TestSink {
    completed: std::sync::Mutex<Vec<Request>>,
}

impl TestSink {
    fn new() -> Self {
        TestSink { completed: std::sync::Mutex::new(Vec::new()) }
    }

    fn take(&self) -> Vec<Request> {
        std::mem::take(&mut *self.completed.lock().unwrap())
    }
}

impl CompletionSink for TestSink {
    fn return_io_pending(&self, req: Request) {
        self.completed.lock().unwrap().push(req);
    }
}

/// Spawns a one-shot fake cache peer on loopback: accepts a single
/// connection, replies `VERSION ...` to the validation handshake, then hands
/// the connection to `body` for the scenario-specific exchange.
fn spawn_peer<F>(body: F) -> u16
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut probe = [0u8; 64];
        let n = stream.read(&mut probe).unwrap();
        assert_eq!(&probe[..n], b"version\r\n");
        stream.write_all(b"VERSION 1.6.9\r\n").unwrap();
        body(stream);
    });
    port
}

fn poll_fd(fd: RawFd, timeout_ms: i32) -> (bool, bool) {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN | libc::POLLOUT, revents: 0 };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    (pfd.revents & libc::POLLIN != 0, pfd.revents & libc::POLLOUT != 0)
}

/// Drives `backend` by polling its raw fd directly until `done` is true or
/// two seconds elapse.
fn drive(backend: &mut Backend, sink: &dyn CompletionSink, done: impl Fn(&Backend) -> bool) {
    let start = Instant::now();
    loop {
        if done(backend) {
            return;
        }
        assert!(start.elapsed() < Duration::from_secs(2), "timed out driving backend");
        let fd = match backend.fd() {
            Some(fd) => fd,
            None => {
                thread::sleep(Duration::from_millis(5));
                continue;
            }
        };
        let (readable, writable) = poll_fd(fd, 50);
        if writable {
            backend.on_writable().expect("unexpected write failure in test");
        }
        if readable {
            backend.on_readable(sink).expect("unexpected read failure in test");
        }
    }
}

fn new_backend(port: u16) -> Backend {
    let endpoint = BackendEndpoint { host: "127.0.0.1".to_string(), port };
    let mut backend = Backend::new(endpoint, 16 * 1024, 64, 3);
    backend.begin_connect().expect("connect should start");
    backend
}

#[test]
fn single_get_hit() {
    let port = spawn_peer(|mut stream| {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"get k\r\n");
        stream.write_all(b"VALUE k 0 5\r\nhello\r\nEND\r\n").unwrap();
    });

    let mut backend = new_backend(port);
    let sink = TestSink::new();
    drive(&mut backend, &sink, |b| b.state() == BackendState::Ready);

    backend.submit(vec![Bytes::from_static(b"get k\r\n")], false, &sink);
    drive(&mut backend, &sink, |_| !sink.completed.lock().unwrap().is_empty());

    let completed = sink.take();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].response.status, Some(RequestStatus::Ok));
    assert_eq!(completed[0].response.buf, b"VALUE k 0 5\r\nhello\r\nEND\r\n");
}

#[test]
fn get_miss() {
    let port = spawn_peer(|mut stream| {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"get k\r\n");
        stream.write_all(b"END\r\n").unwrap();
    });

    let mut backend = new_backend(port);
    let sink = TestSink::new();
    drive(&mut backend, &sink, |b| b.state() == BackendState::Ready);

    backend.submit(vec![Bytes::from_static(b"get k\r\n")], false, &sink);
    drive(&mut backend, &sink, |_| !sink.completed.lock().unwrap().is_empty());

    let completed = sink.take();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].response.status, Some(RequestStatus::Ok));
    assert_eq!(completed[0].response.buf, b"END\r\n");
}

#[test]
fn split_value_arrives_in_two_chunks() {
    let port = spawn_peer(|mut stream| {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"get k\r\n");
        stream.write_all(b"VALUE k 0 5\r\nhel").unwrap();
        thread::sleep(Duration::from_millis(20));
        stream.write_all(b"lo\r\nEND\r\n").unwrap();
    });

    let mut backend = new_backend(port);
    let sink = TestSink::new();
    drive(&mut backend, &sink, |b| b.state() == BackendState::Ready);

    backend.submit(vec![Bytes::from_static(b"get k\r\n")], false, &sink);
    drive(&mut backend, &sink, |_| !sink.completed.lock().unwrap().is_empty());

    let completed = sink.take();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].response.buf, b"VALUE k 0 5\r\nhello\r\nEND\r\n");
}

#[test]
fn pipelined_two_requests_complete_in_submission_order() {
    let port = spawn_peer(|mut stream| {
        let mut buf = [0u8; 128];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"set a 0 0 1\r\nx\r\nget a\r\n");
        stream.write_all(b"STORED\r\nVALUE a 0 1\r\nx\r\nEND\r\n").unwrap();
    });

    let mut backend = new_backend(port);
    let sink = TestSink::new();
    drive(&mut backend, &sink, |b| b.state() == BackendState::Ready);

    backend.submit(vec![Bytes::from_static(b"set a 0 0 1\r\nx\r\n")], false, &sink);
    backend.submit(vec![Bytes::from_static(b"get a\r\n")], false, &sink);
    drive(&mut backend, &sink, |_| sink.completed.lock().unwrap().len() >= 2);

    let completed = sink.take();
    assert_eq!(completed.len(), 2);
    assert!(completed[0].submission_index < completed[1].submission_index);
    assert_eq!(completed[0].response.buf, b"STORED\r\n");
    assert_eq!(completed[1].response.buf, b"VALUE a 0 1\r\nx\r\nEND\r\n");
}

#[test]
fn trailing_garbage_completes_then_resets() {
    let port = spawn_peer(|mut stream| {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"get k\r\n");
        let mut resp = b"VALUE k 0 5\r\nhello\r\nEND\r\n".to_vec();
        resp.push(b'X');
        stream.write_all(&resp).unwrap();
    });

    let mut backend = new_backend(port);
    let sink = TestSink::new();
    drive(&mut backend, &sink, |b| b.state() == BackendState::Ready);

    backend.submit(vec![Bytes::from_static(b"get k\r\n")], false, &sink);

    let start = Instant::now();
    let trailing_err = loop {
        assert!(start.elapsed() < Duration::from_secs(2), "timed out");
        let fd = backend.fd().unwrap();
        let (readable, writable) = poll_fd(fd, 50);
        if writable {
            backend.on_writable().unwrap();
        }
        if readable {
            if let Err(kind) = backend.on_readable(&sink) {
                break kind;
            }
        }
    };
    assert_eq!(trailing_err, BackendFailureKind::TrailingData);

    let completed = sink.take();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].response.buf, b"VALUE k 0 5\r\nhello\r\nEND\r\n");
}

#[test]
fn validation_failure_marks_bad_after_failure_limit() {
    // A peer that always answers the version probe with ERROR instead of
    // VERSION, forcing badvalidate on every connect attempt.
    fn bad_peer() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let mut buf = [0u8; 64];
                if stream.read(&mut buf).is_ok() {
                    let _ = stream.write_all(b"ERROR\r\n");
                }
            }
        });
        port
    }

    let port = bad_peer();
    let endpoint = BackendEndpoint { host: "127.0.0.1".to_string(), port };
    let mut backend = Backend::new(endpoint, 16 * 1024, 64, 2);
    backend.begin_connect().expect("connect should start");
    let sink = TestSink::new();

    let start = Instant::now();
    while !backend.is_bad() {
        assert!(start.elapsed() < Duration::from_secs(2), "timed out waiting for backend to go bad");
        let fd = match backend.fd() {
            Some(fd) => fd,
            None => {
                thread::sleep(Duration::from_millis(5));
                continue;
            }
        };
        let (readable, writable) = poll_fd(fd, 50);
        if writable {
            let _ = backend.on_writable();
        }
        if readable {
            if let Err(kind) = backend.on_readable(&sink) {
                assert_eq!(kind, BackendFailureKind::BadValidate);
                backend.reset(kind, &sink);
            }
        }
    }

    assert!(backend.failed_count() >= 2);
}
