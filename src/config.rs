//! Hub runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_PORT;
use crate::scheduler::SchedulerConfig;

/// Configuration for the hub server.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interface the listener binds to.
    pub host: String,
    /// TCP port of the hub listener.
    pub port: u16,
    /// Sqlite connection string for the step store.
    pub database_url: String,
    /// Base directory of the filesystem blob store.
    pub blob_path: PathBuf,
    /// How long a connection may take to deliver one full request frame
    /// before it is abandoned.
    pub read_timeout: Duration,
    /// Capacity of the bounded execution queue; producers block when
    /// it is full.
    pub queue_capacity: usize,
    /// Scheduling parameters.
    pub scheduler: SchedulerConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            database_url: "sqlite://stephub.db".to_string(),
            blob_path: PathBuf::from("./stephub-blobs"),
            read_timeout: Duration::from_secs(30),
            queue_capacity: 1024,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl HubConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listener host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the listener port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the sqlite connection string.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Sets the blob store base directory.
    pub fn with_blob_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.blob_path = path.into();
        self
    }

    /// Sets the per-request read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the execution-queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the scheduling parameters.
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Returns the listener address as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
