//! Completion-based event driver, grounded on the `io-uring` crate's
//! submission/completion queue pair.
//!
//! Unlike a typical io_uring server that issues `Read`/`Write` SQEs
//! directly, this driver only asks the kernel "is this fd ready", via
//! `opcode::PollAdd`, linked to an `opcode::LinkTimeout`. The actual
//! non-blocking recv/send still happens in `backend::connection` through
//! the same socket2 calls the readiness driver uses, so `Backend` stays
//! driver-agnostic.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};

use super::BackendEvent;

/// Packed into `user_data`: low 2 bits are the op kind, the rest is the
/// backend token (or, for Notifier/Clock, unused).
const OP_READ: u64 = 0;
const OP_WRITE: u64 = 1;
const OP_TIMEOUT: u64 = 2;
const OP_NOTIFIER: u64 = 3;
const OP_CLOCK: u64 = 4;
const OP_LINKED_TIMEOUT: u64 = 5;
const OP_BITS: u32 = 3;
const OP_MASK: u64 = (1 << OP_BITS) - 1;

fn pack(op: u64, token: usize) -> u64 {
    ((token as u64) << OP_BITS) | op
}

fn unpack(user_data: u64) -> (u64, usize) {
    (user_data & OP_MASK, (user_data >> OP_BITS) as usize)
}

pub struct CompletionDriver {
    ring: IoUring,
    notifier_fd: RawFd,
    timespecs: Vec<Box<types::Timespec>>,
}

/// Creates the eventfd backing this driver's notifier. Submitter
/// threads write to the returned fd directly via `libc::write` to wake the
/// event thread; `close(2)` it when the driver (and its event thread) exits.
pub fn create_notifier_fd() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

impl CompletionDriver {
    pub fn new(entries: u32, notifier_fd: RawFd) -> io::Result<Self> {
        Ok(CompletionDriver { ring: IoUring::new(entries)?, notifier_fd, timespecs: Vec::new() })
    }

    pub fn notifier_fd(&self) -> RawFd {
        self.notifier_fd
    }

    fn timespec(&mut self, timeout: Duration) -> *const types::Timespec {
        let ts = Box::new(types::Timespec::new().sec(timeout.as_secs()).nsec(timeout.subsec_nanos()));
        let ptr = ts.as_ref() as *const types::Timespec;
        self.timespecs.push(ts);
        ptr
    }

    /// Pushes an SQE, submitting immediately (rather than batching) if the
    /// queue is full, so a saturated ring applies backpressure to the event
    /// thread instead of growing an unbounded pending-SQE buffer.
    fn push(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                self.ring.submission().push(&entry).map_err(|_| {
                    io::Error::new(io::ErrorKind::Other, "submission queue full even after a flush")
                })?;
            }
        }
        Ok(())
    }

    fn submit_poll(&mut self, op: u64, token: usize, fd: RawFd, flags: libc::c_short, timeout: Duration) -> io::Result<()> {
        let user_data = pack(op, token);
        let poll = opcode::PollAdd::new(types::Fd(fd), flags as u32)
            .build()
            .user_data(user_data)
            .flags(squeue::Flags::IO_LINK);
        self.push(poll)?;

        let ts = self.timespec(timeout);
        let link_timeout = opcode::LinkTimeout::new(ts)
            .build()
            .user_data(pack(OP_LINKED_TIMEOUT, token));
        self.push(link_timeout)
    }
}

impl super::EventDriver for CompletionDriver {
    /// No separate registration step: every submission names the fd directly.
    fn register(&mut self, _token: usize, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn arm_read(&mut self, token: usize, fd: RawFd, timeout: Duration) -> io::Result<()> {
        self.submit_poll(OP_READ, token, fd, libc::POLLIN, timeout)
    }

    fn arm_write(&mut self, token: usize, fd: RawFd, timeout: Duration) -> io::Result<()> {
        self.submit_poll(OP_WRITE, token, fd, libc::POLLOUT, timeout)
    }

    fn arm_retry(&mut self, token: usize, timeout: Duration) -> io::Result<()> {
        let ts = self.timespec(timeout);
        let entry = opcode::Timeout::new(ts).build().user_data(pack(OP_TIMEOUT, token));
        self.push(entry)
    }

    fn arm_notifier(&mut self) -> io::Result<()> {
        self.submit_poll(OP_NOTIFIER, 0, self.notifier_fd, libc::POLLIN, Duration::from_secs(3600))
    }

    fn arm_clock(&mut self, timeout: Duration) -> io::Result<()> {
        let ts = self.timespec(timeout);
        let entry = opcode::Timeout::new(ts).build().user_data(pack(OP_CLOCK, 0));
        self.push(entry)
    }

    fn await_next_event(&mut self, out: &mut Vec<BackendEvent>) -> io::Result<()> {
        self.ring.submit_and_wait(1)?;
        self.timespecs.clear();
        let mut cq = self.ring.completion();
        cq.sync();
        for cqe in &mut cq {
            let (op, token) = unpack(cqe.user_data());
            // A negative result on a poll/timeout op almost always means the
            // linked timeout fired first (-ECANCELED) or the wait elapsed
            // (-ETIME); both are surfaced as a plain Timeout so the backend
            // state machine resets uniformly regardless of driver.
            let cancelled = cqe.result() < 0;
            match op {
                OP_READ if !cancelled => out.push(BackendEvent::Readable(token)),
                OP_WRITE if !cancelled => out.push(BackendEvent::Writable(token)),
                OP_NOTIFIER if !cancelled => {
                    // Drain the eventfd counter so the next PollAdd doesn't fire spuriously.
                    let mut buf = [0u8; 8];
                    unsafe { libc::read(self.notifier_fd, buf.as_mut_ptr() as *mut _, 8) };
                    out.push(BackendEvent::Notifier)
                }
                OP_CLOCK => out.push(BackendEvent::Clock),
                OP_TIMEOUT => out.push(BackendEvent::Timeout(token)),
                OP_READ | OP_WRITE | OP_NOTIFIER => out.push(BackendEvent::Timeout(token)),
                OP_LINKED_TIMEOUT => {} // no-op; the linked op's own CQE carries the real signal
                _ => {}
            }
        }
        Ok(())
    }
}
