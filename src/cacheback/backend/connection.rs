//! The Backend type: connection lifecycle, write-flush engine,
//! response parser driver and the failure/reset chokepoint,
//! all bound to one upstream socket.

use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::cacheback::common::bytes_to_slice_mut;
use crate::cacheback::config::BackendEndpoint;
use crate::cacheback::protocol::{self, ParseOutcome, ResponseKind, ENDLEN, END_LITERAL};

use super::failure::BackendFailureKind;
use super::queue::{CompletionSink, Request, RequestQueue, RequestStatus};
use super::state::{BackendState, ParseState};

/// The literal validation handshake request.
pub const VERSION_REQUEST: &[u8] = b"version\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every currently-queued request is fully written; no write interest needed.
    Complete,
    /// Partial send, `EAGAIN`, or more requests queued past `be_iov_max`;
    /// caller should (re-)arm writable interest.
    Pending,
}

/// What the caller should arm after a reset/reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// A non-blocking connect is in flight (or just finished); arm the
    /// connecting/writable path with a connect-timeout.
    Reconnecting,
    /// Consecutive failures exceeded `backend_failure_limit`; arm a retry
    /// timer instead of reconnecting immediately.
    Bad,
}

pub struct Backend {
    pub endpoint: BackendEndpoint,
    sock: Option<Socket>,
    rbuf: BytesMut,
    read_buffer_size: usize,
    be_iov_max: usize,
    failure_limit: u32,
    queue: RequestQueue,
    parse_state: ParseState,
    conn_state: BackendState,
    can_write: bool,
    /// Membership in the event thread's per-tick active list.
    pub stacked: bool,
    failed_count: u32,
    submission_counter: u64,
}

impl Backend {
    pub fn new(endpoint: BackendEndpoint, read_buffer_size: u32, be_iov_max: usize, failure_limit: u32) -> Self {
        Backend {
            endpoint,
            sock: None,
            rbuf: BytesMut::with_capacity(read_buffer_size as usize),
            read_buffer_size: read_buffer_size as usize,
            be_iov_max,
            failure_limit,
            queue: RequestQueue::new(),
            parse_state: ParseState::Parse,
            conn_state: BackendState::Disconnected,
            can_write: false,
            stacked: false,
            failed_count: 0,
            submission_counter: 0,
        }
    }

    pub fn state(&self) -> BackendState {
        self.conn_state
    }

    pub fn is_bad(&self) -> bool {
        self.conn_state == BackendState::Bad
    }

    pub fn is_connecting_or_validating(&self) -> bool {
        matches!(self.conn_state, BackendState::Connecting | BackendState::Validating)
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(Socket::as_raw_fd)
    }

    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// Applies a freshly-refreshed Tunables snapshot.
    pub fn set_failure_limit(&mut self, limit: u32) {
        self.failure_limit = limit;
    }

    fn next_submission_index(&mut self) -> u64 {
        let idx = self.submission_counter;
        self.submission_counter += 1;
        idx
    }

    /// Dequeuer: attach a freshly submitted request to this backend's
    /// queue, or fail it immediately if the backend is bad.
    pub fn submit(&mut self, iov: Vec<Bytes>, ascii_multiget: bool, sink: &dyn CompletionSink) {
        let idx = self.next_submission_index();
        let mut req = Request::new(iov, ascii_multiget, false, idx);
        if self.is_bad() {
            req.response.status = Some(RequestStatus::Error);
            sink.return_io_pending(req);
            return;
        }
        self.queue.push(req);
    }

    fn resolve_addr(&self) -> io::Result<SocketAddr> {
        (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved"))
    }

    /// Connect: issue a non-blocking connect. If it completes
    /// synchronously, still drive it through the writable-event path so both
    /// cases share one code path.
    pub fn begin_connect(&mut self) -> Result<(), BackendFailureKind> {
        let addr = self.resolve_addr().map_err(|_| BackendFailureKind::Connecting)?;
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|_| BackendFailureKind::Connecting)?;
        socket.set_nonblocking(true).map_err(|_| BackendFailureKind::Connecting)?;
        let connected_immediately = match socket.connect(&addr.into()) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
            Err(_) => return Err(BackendFailureKind::Connecting),
        };

        self.sock = Some(socket);
        self.conn_state = BackendState::Connecting;
        self.can_write = false;
        self.rbuf.clear();
        self.parse_state = ParseState::Parse;

        if connected_immediately {
            self.on_connect_writable()
        } else {
            Ok(())
        }
    }

    /// Post-writable (connecting): check the connect result, then send
    /// the validation probe through the ordinary write-flush engine rather
    /// than a special single-write path.
    pub fn on_connect_writable(&mut self) -> Result<(), BackendFailureKind> {
        {
            let sock = self.sock.as_ref().ok_or(BackendFailureKind::Connecting)?;
            match sock.take_error() {
                Ok(None) => {}
                _ => return Err(BackendFailureKind::Connecting),
            }
        }
        self.conn_state = BackendState::Validating;
        self.can_write = true;
        let idx = self.next_submission_index();
        let mut probe = Request::new(vec![Bytes::from_static(VERSION_REQUEST)], false, false, idx);
        probe.is_validation = true;
        self.queue.push(probe);
        Ok(())
    }

    /// Dispatch for a writable event: finishes a
    /// pending connect first if needed, then drives the write-flush engine.
    pub fn on_writable(&mut self) -> Result<WriteOutcome, BackendFailureKind> {
        if self.conn_state == BackendState::Connecting {
            self.on_connect_writable()?;
        }
        self.can_write = true;
        self.flush_writes()
    }

    /// Write-flush engine: gathers from `io_next` forward capped at
    /// `be_iov_max` segments and issues exactly one vectored write.
    pub fn flush_writes(&mut self) -> Result<WriteOutcome, BackendFailureKind> {
        let sock = match self.sock.as_mut() {
            Some(s) => s,
            None => return Ok(WriteOutcome::Complete),
        };

        let mut slices: Vec<IoSlice> = Vec::new();
        let mut idxs: Vec<usize> = Vec::new();
        let mut more_pending = false;
        'gather: for (idx, req) in self.queue.iter_from_io_next() {
            if req.flushed {
                continue;
            }
            for b in &req.iov {
                if slices.len() >= self.be_iov_max {
                    more_pending = true;
                    break 'gather;
                }
                slices.push(IoSlice::new(b));
            }
            idxs.push(idx);
        }

        if slices.is_empty() {
            self.can_write = false;
            return Ok(WriteOutcome::Complete);
        }

        match sock.write_vectored(&slices) {
            Ok(0) => {
                self.can_write = false;
                Ok(WriteOutcome::Pending)
            }
            Ok(mut n) => {
                'consume: for idx in &idxs {
                    if n == 0 {
                        break;
                    }
                    let req = self.queue.get_mut(*idx);
                    while n > 0 {
                        let done = match req.iov.first_mut() {
                            Some(front) => {
                                let flen = front.len();
                                if n >= flen {
                                    n -= flen;
                                    req.iov.remove(0);
                                    req.iov.is_empty()
                                } else {
                                    *front = front.split_off(n);
                                    n = 0;
                                    false
                                }
                            }
                            None => true,
                        };
                        if done {
                            break;
                        }
                    }
                    if req.iov.is_empty() {
                        req.flushed = true;
                        self.queue.advance_io_next_past(*idx);
                    } else {
                        break 'consume;
                    }
                }

                if self.queue.io_next_index().is_some() || more_pending {
                    self.can_write = true;
                    Ok(WriteOutcome::Pending)
                } else {
                    Ok(WriteOutcome::Complete)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.can_write = false;
                Ok(WriteOutcome::Pending)
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "vectored write failed");
                Err(BackendFailureKind::Writing)
            }
        }
    }

    /// Dispatch for a readable event: reads into the
    /// tail of `rbuf`, then drives the parser state machine.
    pub fn on_readable(&mut self, sink: &dyn CompletionSink) -> Result<(), BackendFailureKind> {
        self.rbuf.reserve(self.read_buffer_size);
        let n = {
            let sock = self.sock.as_mut().ok_or(BackendFailureKind::ClosedSock)?;
            // Safety: we only read into the spare tail capacity and commit
            // exactly the bytes the kernel reports writing, via advance_mut below.
            let spare = unsafe { bytes_to_slice_mut(&mut self.rbuf) };
            match sock.read(spare) {
                Ok(0) => return Err(BackendFailureKind::Disconnected),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "read failed");
                    return Err(BackendFailureKind::Reading);
                }
            }
        };
        // Safety: `n` bytes were just written into the spare capacity above.
        unsafe { self.rbuf.advance_mut(n) };
        self.pump(sink)
    }

    /// Parse/read_end/want_read/next state machine, driven until it
    /// needs more bytes than are currently buffered.
    fn pump(&mut self, sink: &dyn CompletionSink) -> Result<(), BackendFailureKind> {
        loop {
            match self.parse_state {
                ParseState::Parse => {
                    if self.queue.is_empty() {
                        return self.check_idle_trailing_data();
                    }
                    match protocol::parse_response_header(&self.rbuf) {
                        ParseOutcome::NeedMore => return Ok(()),
                        ParseOutcome::Error => {
                            let validating = self.queue.head().map(|r| r.is_validation).unwrap_or(false);
                            return Err(if validating { BackendFailureKind::ReadValidate } else { BackendFailureKind::Parsing });
                        }
                        ParseOutcome::Parsed(header) => self.on_header_parsed(header)?,
                    }
                }
                ParseState::WantRead => {
                    let head = self.queue.head_mut().expect("want_read with empty queue");
                    let take = std::cmp::min(self.rbuf.len(), head.response.value_remaining);
                    if take > 0 {
                        head.response.buf.extend_from_slice(&self.rbuf[..take]);
                        head.response.value_remaining -= take;
                        self.rbuf.advance(take);
                    }
                    let head = self.queue.head().expect("want_read with empty queue");
                    if head.response.value_remaining == 0 {
                        self.parse_state = if head.response.awaiting_end_literal {
                            ParseState::ReadEnd
                        } else {
                            ParseState::Next
                        };
                    } else {
                        return Ok(());
                    }
                }
                ParseState::ReadEnd => {
                    if self.rbuf.len() < ENDLEN {
                        return Ok(());
                    }
                    if &self.rbuf[..ENDLEN] != END_LITERAL {
                        return Err(BackendFailureKind::MissingEnd);
                    }
                    let head = self.queue.head_mut().expect("read_end with empty queue");
                    head.response.buf.extend_from_slice(END_LITERAL);
                    self.rbuf.advance(ENDLEN);
                    self.parse_state = ParseState::Next;
                }
                ParseState::Next => {
                    self.complete_head(sink)?;
                    if self.queue.is_empty() {
                        return self.check_idle_trailing_data();
                    }
                    if self.rbuf.is_empty() {
                        return Ok(());
                    }
                    self.parse_state = ParseState::Parse;
                }
            }
        }
    }

    fn check_idle_trailing_data(&mut self) -> Result<(), BackendFailureKind> {
        if !self.rbuf.is_empty() {
            return Err(BackendFailureKind::TrailingData);
        }
        Ok(())
    }

    fn on_header_parsed(&mut self, header: protocol::ParsedHeader) -> Result<(), BackendFailureKind> {
        if header.kind == ResponseKind::End {
            self.rbuf.advance(header.header_len);
            let head = self.queue.head_mut().expect("parse with empty queue");
            if !head.ascii_multiget {
                // A standalone miss for a single-key GET: the bare END line
                // is itself the whole response handed back to the caller.
                head.response.buf.extend_from_slice(END_LITERAL);
            }
            // In ascii_multiget mode this END is consumed without becoming
            // part of the assembled response.
            self.parse_state = ParseState::Next;
            return Ok(());
        }

        let head = self.queue.head_mut().expect("parse with empty queue");
        head.response.buf.extend_from_slice(&self.rbuf[..header.header_len]);
        self.rbuf.advance(header.header_len);
        head.response.value_remaining = header.value_len;
        head.response.awaiting_end_literal = header.needs_end_literal();

        if header.value_len == 0 {
            self.parse_state = if header.needs_end_literal() { ParseState::ReadEnd } else { ParseState::Next };
            return Ok(());
        }

        // The parser may already have the whole value buffered; don't double-copy.
        let take = std::cmp::min(self.rbuf.len(), header.value_len);
        if take > 0 {
            let head = self.queue.head_mut().expect("parse with empty queue");
            head.response.buf.extend_from_slice(&self.rbuf[..take]);
            head.response.value_remaining -= take;
            self.rbuf.advance(take);
        }

        let head = self.queue.head().expect("parse with empty queue");
        self.parse_state = if head.response.value_remaining == 0 {
            if head.response.awaiting_end_literal { ParseState::ReadEnd } else { ParseState::Next }
        } else {
            ParseState::WantRead
        };
        Ok(())
    }

    /// Pops the head request and either completes the validation handshake
    /// or hands the response back to the submitter.
    fn complete_head(&mut self, sink: &dyn CompletionSink) -> Result<(), BackendFailureKind> {
        let mut req = self.queue.pop_head().expect("next with empty queue");
        if req.is_validation {
            return if protocol::is_version_reply(&req.response.buf) {
                self.conn_state = BackendState::Ready;
                self.failed_count = 0;
                Ok(())
            } else {
                Err(BackendFailureKind::BadValidate)
            };
        }
        req.response.status = Some(RequestStatus::Ok);
        sink.return_io_pending(req);
        Ok(())
    }

    /// The single chokepoint for fatal per-backend errors. Purges the queue
    /// with an error status, resets buffers, and reconnects (or marks the
    /// backend bad if over the failure limit).
    pub fn reset(&mut self, kind: BackendFailureKind, sink: &dyn CompletionSink) -> ResetOutcome {
        warn!(endpoint = %self.endpoint, failure = %kind, "resetting backend");
        for mut req in self.queue.drain_all() {
            if req.is_validation {
                continue;
            }
            req.response.status = Some(RequestStatus::Error);
            sink.return_io_pending(req);
        }
        self.rbuf.clear();
        self.parse_state = ParseState::Parse;
        self.can_write = false;
        self.sock = None;
        self.conn_state = BackendState::Disconnected;

        self.failed_count += 1;
        if self.failed_count > self.failure_limit {
            self.conn_state = BackendState::Bad;
            return ResetOutcome::Bad;
        }

        match self.begin_connect() {
            Ok(()) => ResetOutcome::Reconnecting,
            Err(_) => {
                self.conn_state = BackendState::Disconnected;
                ResetOutcome::Reconnecting
            }
        }
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct RecordingSink {
        seen: Mutex<Vec<Request>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink { seen: Mutex::new(Vec::new()) }
        }
    }

    impl CompletionSink for RecordingSink {
        fn return_io_pending(&self, req: Request) {
            self.seen.lock().unwrap().push(req);
        }
    }

    fn endpoint(port: u16) -> BackendEndpoint {
        BackendEndpoint { host: "127.0.0.1".to_string(), port }
    }

    #[test]
    fn new_backend_starts_disconnected_with_no_socket() {
        let backend = Backend::new(endpoint(0), 4096, 16, 3);
        assert_eq!(backend.state(), BackendState::Disconnected);
        assert!(backend.fd().is_none());
        assert_eq!(backend.depth(), 0);
        assert_eq!(backend.failed_count(), 0);
    }

    #[test]
    fn submit_on_bad_backend_fails_request_immediately() {
        let mut backend = Backend::new(endpoint(0), 4096, 16, 3);
        backend.conn_state = BackendState::Bad;
        let sink = RecordingSink::new();
        backend.submit(vec![Bytes::from_static(b"get k\r\n")], false, &sink);

        assert_eq!(backend.depth(), 0, "a bad backend must never queue a request");
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].response.status, Some(RequestStatus::Error));
    }

    #[test]
    fn begin_connect_to_closed_port_eventually_surfaces_connecting_failure() {
        // Bind and immediately drop the listener so the port refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut backend = Backend::new(endpoint(port), 4096, 16, 3);
        backend.begin_connect().expect("non-blocking connect should start without error");
        assert_eq!(backend.state(), BackendState::Connecting);

        let fd = backend.fd().expect("connecting backend has a socket");
        let start = std::time::Instant::now();
        let mut result = Ok(());
        loop {
            assert!(start.elapsed() < Duration::from_secs(2), "timed out waiting for connection refusal");
            let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
            unsafe { libc::poll(&mut pfd, 1, 50) };
            if pfd.revents & libc::POLLOUT != 0 {
                result = backend.on_writable().map(|_| ());
                break;
            }
        }
        assert!(result.is_err(), "connecting to a closed port must surface as a failure, not silent success");
    }

    #[test]
    fn reset_drains_queued_requests_with_error_status() {
        let mut backend = Backend::new(endpoint(0), 4096, 16, 3);
        let sink = RecordingSink::new();
        backend.queue.push(Request::new(vec![Bytes::from_static(b"get a\r\n")], false, false, 0));
        backend.queue.push(Request::new(vec![Bytes::from_static(b"get b\r\n")], false, false, 1));

        backend.reset(BackendFailureKind::Disconnected, &sink);

        assert_eq!(backend.depth(), 0);
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.response.status == Some(RequestStatus::Error)));
    }

    #[test]
    fn reset_marks_backend_bad_once_failure_limit_exceeded() {
        let mut backend = Backend::new(endpoint(0), 4096, 16, 1);
        let sink = RecordingSink::new();

        assert_eq!(backend.reset(BackendFailureKind::Timeout, &sink), ResetOutcome::Reconnecting);
        assert_eq!(backend.failed_count(), 1);
        assert!(!backend.is_bad());

        assert_eq!(backend.reset(BackendFailureKind::Timeout, &sink), ResetOutcome::Bad);
        assert_eq!(backend.failed_count(), 2);
        assert!(backend.is_bad());
    }
}
