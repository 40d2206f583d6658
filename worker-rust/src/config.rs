use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PORT: u16 = 12345;

/// How often the pool process checks worker liveness.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a worker gets to close its connection before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorAddr {
    pub host: String,
    pub port: u16,
}

impl CoordinatorAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for CoordinatorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator: CoordinatorAddr,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Binary re-executed for device enumeration and for each worker.
    pub worker_program: PathBuf,
}

impl Config {
    pub fn new(coordinator: CoordinatorAddr, worker_program: PathBuf) -> Self {
        Self {
            coordinator,
            poll_interval: POLL_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,
            worker_program,
        }
    }
}
