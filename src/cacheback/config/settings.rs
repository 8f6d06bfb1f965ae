use std::env;
use std::fs::File;
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, info_span};

use crate::cacheback::common::{Error, Result};

/// One upstream cache-protocol peer, as a connect target. Reconnects reuse
/// the same host/port.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// mio-based readiness polling.
    Readiness,
    /// io_uring completion queue. Requires a Linux kernel with io_uring support.
    Completion,
}

impl Default for DriverKind {
    fn default() -> Self {
        DriverKind::Readiness
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// config_path is the path of the loaded config file
    #[serde(default)]
    config_path: PathBuf,
    /// the set of upstream backends this process connects to
    pub backends: Vec<BackendEndpoint>,
    /// number of event threads to spawn; each owns a disjoint subset of backends
    #[serde(default = "default_num_event_threads")]
    pub num_event_threads: u32,
    /// size in bytes of each backend's fixed read buffer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: u32,
    /// BE_IOV_MAX: cap on segments gathered into one vectored write
    #[serde(default = "default_be_iov_max")]
    pub be_iov_max: usize,
    /// consecutive-failure threshold before a backend is marked bad
    #[serde(default = "default_backend_failure_limit")]
    pub backend_failure_limit: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u32,
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u32,
    /// how often (seconds) each event thread refreshes its Tunables snapshot
    #[serde(default = "default_tunables_refresh_seconds")]
    pub tunables_refresh_seconds: u64,
    /// which EventDriver implementation to run
    #[serde(default)]
    pub driver: DriverKind,
}

fn default_num_event_threads() -> u32 { num_cpus::get() as u32 }
const fn default_read_buffer_size() -> u32 { 16 * 1024 }
const fn default_be_iov_max() -> usize { 64 }
const fn default_backend_failure_limit() -> u32 { 3 }
const fn default_connect_timeout_ms() -> u32 { 3_000 }
const fn default_read_timeout_ms() -> u32 { 3_000 }
const fn default_retry_timeout_ms() -> u32 { 3_000 }
const fn default_tunables_refresh_seconds() -> u64 { 3 }

/// The mutable subset of Settings each event thread snapshots periodically.
/// Kept small and Copy so refreshing it under the shared Mutex is cheap.
#[derive(Debug, Copy, Clone)]
pub struct Tunables {
    pub connect_timeout_ms: u32,
    pub read_timeout_ms: u32,
    pub retry_timeout_ms: u32,
    pub backend_failure_limit: u32,
}

impl From<&Settings> for Tunables {
    fn from(s: &Settings) -> Self {
        Tunables {
            connect_timeout_ms: s.connect_timeout_ms,
            read_timeout_ms: s.read_timeout_ms,
            retry_timeout_ms: s.retry_timeout_ms,
            backend_failure_limit: s.backend_failure_limit,
        }
    }
}

impl Settings {
    fn load(&mut self, path: PathBuf) -> Result<()> {
        self.config_path = path;
        if self.backends.is_empty() {
            return Err(Error::new("at least one backend must be configured"));
        }
        if self.read_buffer_size < 4096 {
            self.read_buffer_size = default_read_buffer_size();
        }
        if self.read_buffer_size > 4 * 1024 * 1024 {
            return Err(Error::new("read_buffer_size cannot be > 4MB"));
        }
        self.read_buffer_size = self.read_buffer_size.next_power_of_two();
        if self.num_event_threads == 0 {
            self.num_event_threads = 1;
        }
        Ok(())
    }

    pub fn tunables(&self) -> Tunables {
        Tunables::from(self)
    }
}

static mut SETTINGS: MaybeUninit<Settings> = MaybeUninit::uninit();

/// Returns the global Settings loaded by load_config. Must not be called before that.
pub fn config() -> &'static Settings {
    // Safety: load_config is required to run once at startup before any other thread
    // can observe SETTINGS.
    unsafe { &*SETTINGS.as_ptr() }
}

pub fn load_config() -> Result<&'static Settings> {
    let _span = info_span!("loading config file").entered();
    let config_path = find_config_file("cacheback.yaml")?;
    info!(config_path = %config_path.to_string_lossy().into_owned(), "found config file");
    let file = File::open(&config_path)?;

    // Safety: see config() above.
    let settings = unsafe { &mut *SETTINGS.as_mut_ptr() };
    *settings = serde_yaml::from_reader(file)?;
    settings.load(config_path)?;
    Ok(config())
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    // Use the full path given as the first command line argument
    if let Some(path) = env::args().nth(1) {
        debug!("using config_path passed on command line");
        return Ok(PathBuf::from(path));
    }

    // Check the current directory or any of its parents for config_name
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        loop {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    // Check ~/.config/cacheback/{config_name}
    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());
    let mut conf_path = Path::join(Path::new(&home), Path::join(Path::new(".config/cacheback"), config_name));
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    // Check ~/.{config_name}
    conf_path = Path::join(Path::new(&home), ".".to_string() + config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    // Check /etc/cacheback/{config_name}
    conf_path = Path::join(Path::new("/etc/cacheback"), config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::new(format!("config file {} not found", config_name)))
}
