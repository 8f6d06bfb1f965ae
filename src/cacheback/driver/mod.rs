//! Two event engines behind one contract.
//!
//! The per-backend state machine in `backend::connection` never touches
//! mio or io_uring directly; it only reacts to `BackendEvent` values handed
//! to it by whichever `EventDriver` the event thread constructed.

mod completion;
mod readiness;

pub use self::completion::{create_notifier_fd, CompletionDriver};
pub use self::readiness::ReadinessDriver;

use std::os::unix::io::RawFd;
use std::time::Duration;

/// One thing that happened to a registered backend, or to the thread's own
/// notifier/clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Readable(usize),
    Writable(usize),
    Timeout(usize),
    /// The inbound submission list notifier fired; time to dequeue.
    Notifier,
    /// The periodic tunables-refresh clock fired.
    Clock,
}

/// The contract both drivers implement. `token` is a small dense index the
/// event thread assigns to each backend at construction time (its position
/// in the thread's backend `Vec`); both drivers use it as the completion
/// key so the state machine above never needs to know which driver is live.
pub trait EventDriver {
    /// Readiness needs a one-time fd registration; completion addresses the
    /// fd directly in every submission, so its impl is a no-op.
    fn register(&mut self, token: usize, fd: RawFd) -> std::io::Result<()>;
    fn deregister(&mut self, fd: RawFd) -> std::io::Result<()>;

    fn arm_read(&mut self, token: usize, fd: RawFd, timeout: Duration) -> std::io::Result<()>;
    fn arm_write(&mut self, token: usize, fd: RawFd, timeout: Duration) -> std::io::Result<()>;
    fn arm_retry(&mut self, token: usize, timeout: Duration) -> std::io::Result<()>;
    fn arm_notifier(&mut self) -> std::io::Result<()>;
    fn arm_clock(&mut self, timeout: Duration) -> std::io::Result<()>;

    /// Blocks until at least one event is ready, appending them to `out`.
    fn await_next_event(&mut self, out: &mut Vec<BackendEvent>) -> std::io::Result<()>;
}
