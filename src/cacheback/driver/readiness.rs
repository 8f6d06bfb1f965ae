//! Readiness-based event driver, grounded on mio's `Poll`/`Token`/
//! `Interest`/`Waker` model.
//!
//! mio carries no notion of a timeout per registration, only a timeout on
//! the wait call itself, so this driver keeps its own small timer wheel
//! (a binary heap of deadlines) and computes the next `poll()` timeout as
//! the time remaining until the nearest one. Re-arming a token's timer
//! doesn't remove the old heap entry (the heap has no efficient way to);
//! instead each slot carries a generation counter, bumped on every arm, so
//! `drain_expired` can recognize and drop a deadline that's been superseded
//! by a later arm for the same slot.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use super::BackendEvent;

const NOTIFIER_TOKEN: Token = Token(usize::MAX - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    BackendTimeout(usize),
    Clock,
}

struct Timer {
    deadline: Instant,
    kind: TimerKind,
    generation: u64,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Timer {}
impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

pub struct ReadinessDriver {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    timers: BinaryHeap<Reverse<TimerOrd>>,
    /// Current generation per slot; a popped `Timer` only fires if its
    /// generation still matches, i.e. nothing re-armed that slot since.
    generations: HashMap<TimerKind, u64>,
}

/// Wraps `Timer` so `BinaryHeap` (a max-heap) pops the soonest deadline first
/// once combined with `Reverse`.
struct TimerOrd(Timer);
impl PartialEq for TimerOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}
impl Eq for TimerOrd {}
impl PartialOrd for TimerOrd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}
impl Ord for TimerOrd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl ReadinessDriver {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), NOTIFIER_TOKEN)?);
        Ok(ReadinessDriver {
            poll,
            events: Events::with_capacity(capacity),
            waker,
            timers: BinaryHeap::new(),
            generations: HashMap::new(),
        })
    }

    /// Replace semantics: bumps the slot's generation so any deadline already
    /// in the heap for this `kind` is fenced off from firing, then pushes the
    /// new one carrying the current generation.
    fn push_timer(&mut self, kind: TimerKind, timeout: Duration) {
        let generation = self.generations.entry(kind).or_insert(0);
        *generation += 1;
        let generation = *generation;
        self.timers.push(Reverse(TimerOrd(Timer { deadline: Instant::now() + timeout, kind, generation })));
    }

    fn next_wait(&self) -> Option<Duration> {
        self.timers.peek().map(|Reverse(TimerOrd(t))| t.deadline.saturating_duration_since(Instant::now()))
    }

    fn drain_expired(&mut self, out: &mut Vec<BackendEvent>) {
        let now = Instant::now();
        while let Some(Reverse(TimerOrd(t))) = self.timers.peek() {
            if t.deadline > now {
                break;
            }
            let Reverse(TimerOrd(t)) = self.timers.pop().unwrap();
            if self.generations.get(&t.kind) != Some(&t.generation) {
                continue;
            }
            match t.kind {
                TimerKind::BackendTimeout(token) => out.push(BackendEvent::Timeout(token)),
                TimerKind::Clock => out.push(BackendEvent::Clock),
            }
        }
    }
}

impl super::EventDriver for ReadinessDriver {
    /// Registers a backend's fd for both read and write interest up front;
    /// `arm_read`/`arm_write` below only adjust the timer wheel afterward,
    /// since mio interest sets are cheap to leave broad and the state
    /// machine itself decides whether it cares about a given readiness.
    fn register(&mut self, token: usize, fd: RawFd) -> io::Result<()> {
        let mut source = SourceFd(&fd);
        self.poll.registry().register(&mut source, Token(token), Interest::READABLE | Interest::WRITABLE)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let mut source = SourceFd(&fd);
        self.poll.registry().deregister(&mut source)
    }

    fn arm_read(&mut self, token: usize, _fd: RawFd, timeout: Duration) -> io::Result<()> {
        self.push_timer(TimerKind::BackendTimeout(token), timeout);
        Ok(())
    }

    fn arm_write(&mut self, token: usize, _fd: RawFd, timeout: Duration) -> io::Result<()> {
        self.push_timer(TimerKind::BackendTimeout(token), timeout);
        Ok(())
    }

    fn arm_retry(&mut self, token: usize, timeout: Duration) -> io::Result<()> {
        self.push_timer(TimerKind::BackendTimeout(token), timeout);
        Ok(())
    }

    fn arm_notifier(&mut self) -> io::Result<()> {
        // The waker is armed once at construction; nothing to redo per wake.
        Ok(())
    }

    fn arm_clock(&mut self, timeout: Duration) -> io::Result<()> {
        self.push_timer(TimerKind::Clock, timeout);
        Ok(())
    }

    fn await_next_event(&mut self, out: &mut Vec<BackendEvent>) -> io::Result<()> {
        self.poll.poll(&mut self.events, self.next_wait())?;
        for event in self.events.iter() {
            match event.token() {
                NOTIFIER_TOKEN => out.push(BackendEvent::Notifier),
                Token(token) => {
                    if event.is_readable() {
                        out.push(BackendEvent::Readable(token));
                    }
                    if event.is_writable() {
                        out.push(BackendEvent::Writable(token));
                    }
                }
            }
        }
        self.drain_expired(out);
        Ok(())
    }
}

// Exposed so the event thread can wake this driver from another thread.
impl ReadinessDriver {
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}
