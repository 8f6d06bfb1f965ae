pub mod cacheback;
#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, info_span, Level};
use tracing_subscriber::FmtSubscriber;

use crate::cacheback::backend::{CompletionSink, Request};
use crate::cacheback::common::Result;
use crate::cacheback::config::{load_config, DriverKind, Settings};
use crate::cacheback::driver::{create_notifier_fd, CompletionDriver, ReadinessDriver};
use crate::cacheback::event_thread::EventThread;

pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");
}

/// Loads the configuration settings from cacheback.yaml.
pub fn init_settings() -> Result<&'static Settings> {
    load_config()
}

/// The submitter/worker side of this core is out of scope; this
/// sink just logs completions so the process has somewhere to send them.
struct LoggingSink;

impl CompletionSink for LoggingSink {
    fn return_io_pending(&self, req: Request) {
        match req.response.status {
            Some(crate::cacheback::backend::RequestStatus::Ok) => {
                tracing::debug!(submission_index = req.submission_index, bytes = req.response.buf.len(), "request completed")
            }
            _ => tracing::debug!(submission_index = req.submission_index, "request failed"),
        }
    }
}

fn partition_endpoints(backends: &[crate::cacheback::config::BackendEndpoint], num_threads: usize) -> Vec<Vec<crate::cacheback::config::BackendEndpoint>> {
    let mut chunks: Vec<Vec<_>> = (0..num_threads).map(|_| Vec::new()).collect();
    for (i, endpoint) in backends.iter().enumerate() {
        chunks[i % num_threads].push(endpoint.clone());
    }
    chunks.into_iter().filter(|c| !c.is_empty()).collect()
}

/// Spawns one OS thread per chunk of configured backends, each running the
/// event-thread mainloop to completion (there is no shutdown signal in this
/// core, so these threads run until the process exits).
pub fn run_event_threads(settings: &'static Settings) -> Result<Vec<JoinHandle<()>>> {
    let tunables = Arc::new(Mutex::new(settings.tunables()));
    let sink: Arc<dyn CompletionSink + Send + Sync> = Arc::new(LoggingSink);
    let chunks = partition_endpoints(&settings.backends, settings.num_event_threads as usize);

    let mut handles = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let name = format!("backend-{}", i);
        let tunables = Arc::clone(&tunables);
        let sink = Arc::clone(&sink);
        let driver_kind = settings.driver;
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _span = info_span!("backend_thread", name = %name).entered();
            let result = match driver_kind {
                DriverKind::Readiness => run_readiness_thread(name.clone(), chunk, settings, tunables, sink),
                DriverKind::Completion => run_completion_thread(name.clone(), chunk, settings, tunables, sink),
            };
            if let Err(e) = result {
                error!(error = %e, "event thread exited with an error");
            }
        })?;
        handles.push(handle);
    }
    Ok(handles)
}

fn run_readiness_thread(
    name: String,
    chunk: Vec<crate::cacheback::config::BackendEndpoint>,
    settings: &'static Settings,
    tunables: Arc<Mutex<crate::cacheback::config::Tunables>>,
    sink: Arc<dyn CompletionSink + Send + Sync>,
) -> Result<()> {
    let driver = ReadinessDriver::new(chunk.len().max(1) * 4)?;
    let waker = driver.waker();
    let notify: crate::cacheback::event_thread::Notify = Box::new(move || waker.wake());
    let thread = EventThread::new(name, driver, &chunk, settings, tunables, sink, notify)?;
    thread.run()
}

fn run_completion_thread(
    name: String,
    chunk: Vec<crate::cacheback::config::BackendEndpoint>,
    settings: &'static Settings,
    tunables: Arc<Mutex<crate::cacheback::config::Tunables>>,
    sink: Arc<dyn CompletionSink + Send + Sync>,
) -> Result<()> {
    let notifier_fd = create_notifier_fd()?;
    let driver = CompletionDriver::new(256, notifier_fd)?;
    let notify: crate::cacheback::event_thread::Notify = Box::new(move || {
        let one: u64 = 1;
        let rc = unsafe { libc::write(notifier_fd, &one as *const u64 as *const _, 8) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    });
    let thread = EventThread::new(name, driver, &chunk, settings, tunables, sink, notify)?;
    thread.run()
}
