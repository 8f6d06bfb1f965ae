//! Event thread mainloop & dequeuer.
//!
//! Each event thread owns a disjoint set of backends for its whole life and
//! drives them through exactly one `EventDriver` (readiness or completion,
//! chosen once at thread construction from `Settings::driver`). The only
//! cross-thread state is the inbound submission list (new requests from
//! submitter threads) and a periodic `Tunables` snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, info_span, trace, warn};

use crate::cacheback::backend::{Backend, BackendFailureKind, BackendState, CompletionSink, ResetOutcome, WriteOutcome};
use crate::cacheback::common::update_coarse_monotonic_clock;
use crate::cacheback::config::{BackendEndpoint, Settings, Tunables};
use crate::cacheback::driver::{BackendEvent, EventDriver};

/// One entry on the inbound submission list.
pub struct Submission {
    pub backend_index: usize,
    pub iov: Vec<Bytes>,
    pub ascii_multiget: bool,
}

/// How a submitter thread wakes this event thread's driver after pushing
/// onto the inbound list. Each driver arms its own
/// notifier differently (a mio `Waker` vs. writing to an eventfd backing a
/// `PollAdd`), so the event thread hands `Inbound` whichever closure fits.
pub type Notify = Box<dyn Fn() -> std::io::Result<()> + Send + Sync>;

/// The mutex-protected handoff between submitter threads and one event thread.
pub struct Inbound {
    pending: Mutex<Vec<Submission>>,
    notified: AtomicBool,
    notify: Notify,
}

impl Inbound {
    fn new(notify: Notify) -> Self {
        Inbound { pending: Mutex::new(Vec::new()), notified: AtomicBool::new(false), notify }
    }

    /// Submitter-side call.
    pub fn push(&self, submission: Submission) -> crate::cacheback::common::Result<()> {
        self.pending.lock()?.push(submission);
        self.notified.store(true, Ordering::Release);
        (self.notify)()?;
        Ok(())
    }

    fn drain(&self) -> crate::cacheback::common::Result<Vec<Submission>> {
        self.notified.store(false, Ordering::Release);
        let mut guard = self.pending.lock()?;
        Ok(std::mem::take(&mut *guard))
    }
}

pub struct EventThread<D: EventDriver> {
    name: String,
    backends: Vec<Backend>,
    driver: D,
    inbound: Arc<Inbound>,
    tunables: Arc<Mutex<Tunables>>,
    tunables_refresh: Duration,
    sink: Arc<dyn CompletionSink + Send + Sync>,
    active: Vec<usize>,
    start: Instant,
}

impl<D: EventDriver> EventThread<D> {
    pub fn new(
        name: String,
        mut driver: D,
        endpoints: &[BackendEndpoint],
        settings: &Settings,
        tunables: Arc<Mutex<Tunables>>,
        sink: Arc<dyn CompletionSink + Send + Sync>,
        notify: Notify,
    ) -> crate::cacheback::common::Result<Self> {
        let failure_limit = tunables.lock()?.backend_failure_limit;
        let mut backends = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            backends.push(Backend::new(endpoint.clone(), settings.read_buffer_size, settings.be_iov_max, failure_limit));
        }
        Ok(EventThread {
            name,
            backends,
            driver,
            inbound: Arc::new(Inbound::new(notify)),
            tunables,
            tunables_refresh: Duration::from_secs(settings.tunables_refresh_seconds),
            sink,
            active: Vec::new(),
            start: Instant::now(),
        })
    }

    pub fn inbound(&self) -> Arc<Inbound> {
        Arc::clone(&self.inbound)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tunables.lock().map(|t| t.connect_timeout_ms as u64).unwrap_or(3000))
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.tunables.lock().map(|t| t.read_timeout_ms as u64).unwrap_or(3000))
    }

    fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.tunables.lock().map(|t| t.retry_timeout_ms as u64).unwrap_or(3000))
    }

    /// Runs forever; there is no shutdown signal in this core.
    pub fn run(mut self) -> crate::cacheback::common::Result<()> {
        let _span = info_span!("event_thread", name = %self.name).entered();
        info!("starting");

        for idx in 0..self.backends.len() {
            self.connect(idx)?;
        }
        self.driver.arm_notifier()?;
        self.driver.arm_clock(self.tunables_refresh)?;

        let mut events = Vec::with_capacity(64);
        loop {
            events.clear();
            self.driver.await_next_event(&mut events)?;
            for event in events.drain(..) {
                self.dispatch(event)?;
            }
            self.service_active()?;
        }
    }

    fn connect(&mut self, idx: usize) -> crate::cacheback::common::Result<()> {
        let timeout = self.connect_timeout();
        if let Err(kind) = self.backends[idx].begin_connect() {
            warn!(endpoint = %self.backends[idx].endpoint, failure = %kind, "initial connect failed");
        }
        if let Some(fd) = self.backends[idx].fd() {
            self.driver.register(idx, fd)?;
        }
        self.driver.arm_write(idx, self.backends[idx].fd().unwrap_or(-1), timeout)?;
        if self.backends[idx].state() == BackendState::Ready {
            // begin_connect already drove the writable path to completion; arm the ordinary read/write path.
            self.arm_service(idx)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: BackendEvent) -> crate::cacheback::common::Result<()> {
        match event {
            BackendEvent::Notifier => {
                self.dequeue()?;
                // Readiness's notifier is a persistent Waker registration and
                // ignores this; completion's PollAdd is one-shot and needs
                // resubmitting after every fire.
                self.driver.arm_notifier()?;
            }
            BackendEvent::Clock => self.refresh_tunables()?,
            BackendEvent::Readable(token) => self.on_readable(token)?,
            BackendEvent::Writable(token) => self.on_writable(token)?,
            BackendEvent::Timeout(token) => self.on_timeout(token)?,
        }
        Ok(())
    }

    /// Drains the inbound submission list and attaches each request to its backend.
    fn dequeue(&mut self) -> crate::cacheback::common::Result<()> {
        let submissions = self.inbound.drain()?;
        for submission in submissions {
            let idx = submission.backend_index;
            let was_stacked = self.backends[idx].stacked;
            self.backends[idx].submit(submission.iov, submission.ascii_multiget, self.sink.as_ref());
            if !was_stacked && !self.backends[idx].stacked {
                self.backends[idx].stacked = true;
                self.active.push(idx);
            }
        }
        Ok(())
    }

    fn on_readable(&mut self, idx: usize) -> crate::cacheback::common::Result<()> {
        if let Err(kind) = self.backends[idx].on_readable(self.sink.as_ref()) {
            self.reset(idx, kind)?;
            return Ok(());
        }
        if self.backends[idx].depth() != 0 {
            self.arm_service(idx)?;
        }
        Ok(())
    }

    fn on_writable(&mut self, idx: usize) -> crate::cacheback::common::Result<()> {
        let was_connecting = self.backends[idx].is_connecting_or_validating();
        match self.backends[idx].on_writable() {
            Ok(WriteOutcome::Complete) | Ok(WriteOutcome::Pending) => {}
            Err(kind) => {
                self.reset(idx, kind)?;
                return Ok(());
            }
        }
        if was_connecting && self.backends[idx].state() == BackendState::Ready {
            debug!(endpoint = %self.backends[idx].endpoint, "backend validated");
        }
        self.arm_service(idx)?;
        Ok(())
    }

    fn on_timeout(&mut self, idx: usize) -> crate::cacheback::common::Result<()> {
        self.reset(idx, BackendFailureKind::Timeout)
    }

    fn reset(&mut self, idx: usize, kind: BackendFailureKind) -> crate::cacheback::common::Result<()> {
        if let Some(fd) = self.backends[idx].fd() {
            let _ = self.driver.deregister(fd);
        }
        match self.backends[idx].reset(kind, self.sink.as_ref()) {
            ResetOutcome::Bad => {
                self.driver.arm_retry(idx, self.retry_timeout())?;
            }
            ResetOutcome::Reconnecting => {
                if let Some(fd) = self.backends[idx].fd() {
                    self.driver.register(idx, fd)?;
                }
                if self.backends[idx].state() == BackendState::Ready {
                    self.arm_service(idx)?;
                } else {
                    self.driver.arm_write(idx, self.backends[idx].fd().unwrap_or(-1), self.connect_timeout())?;
                }
            }
        }
        Ok(())
    }

    /// Re-arms ordinary read (and write, if pending) interest with a read timeout.
    fn arm_service(&mut self, idx: usize) -> crate::cacheback::common::Result<()> {
        let fd = self.backends[idx].fd().unwrap_or(-1);
        let timeout = self.read_timeout();
        self.driver.arm_read(idx, fd, timeout)?;
        if self.backends[idx].can_write() {
            self.driver.arm_write(idx, fd, timeout)?;
        }
        Ok(())
    }

    /// Services the per-tick active list: flush writes, then arm read interest.
    fn service_active(&mut self) -> crate::cacheback::common::Result<()> {
        let pending: Vec<usize> = self.active.drain(..).collect();
        for idx in pending {
            self.backends[idx].stacked = false;
            if self.backends[idx].is_connecting_or_validating() || self.backends[idx].is_bad() {
                continue;
            }
            match self.backends[idx].flush_writes() {
                Ok(_) => self.arm_service(idx)?,
                Err(kind) => self.reset(idx, kind)?,
            }
        }
        Ok(())
    }

    fn refresh_tunables(&mut self) -> crate::cacheback::common::Result<()> {
        trace!("refreshing tunables");
        update_coarse_monotonic_clock(self.start);
        let limit = self.tunables.lock()?.backend_failure_limit;
        for backend in &mut self.backends {
            backend.set_failure_limit(limit);
        }
        self.driver.arm_clock(self.tunables_refresh)?;
        Ok(())
    }
}
