//! # Manager Configuration
//!
//! Unified configuration for the dispatcher, the correlator, the event source
//! and the loopback runtime.
//!
//! ## Environment Overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `IPCM_WORKERS` | `workers.count` |
//! | `IPCM_MIN_WORKERS` | `workers.min_workers` |
//! | `IPCM_JOIN_TIMEOUT_MS` | `workers.join_timeout` |
//! | `IPCM_REQUEST_TIMEOUT_MS` | `correlator.request_timeout` |
//! | `IPCM_QUEUE_CAPACITY` | `source.queue_capacity` |
//! | `IPCM_DIF_DIRECTORY` | `dif_directory` (`app=dif,app2=dif2`) |

use std::collections::BTreeMap;
use std::time::Duration;

use ipcm_bus::{DEFAULT_IDLE_POLL_MS, DEFAULT_QUEUE_CAPACITY};
use ipcm_core::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use ipcm_types::{ApplicationName, DifName};
use thiserror::Error;
use tracing::{info, warn};

/// Complete manager configuration.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Worker pool configuration.
    pub workers: WorkerConfig,
    /// Pending request configuration.
    pub correlator: CorrelatorConfig,
    /// Event source configuration.
    pub source: SourceConfig,
    /// Application process name → DIF used to serve its requests.
    pub dif_directory: BTreeMap<String, DifName>,
    /// In-process runtime used when no kernel runtime is attached.
    pub loopback: LoopbackConfig,
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Worker count must be at least 1")]
    ZeroWorkers,

    #[error("min_workers ({min}) exceeds worker count ({count})")]
    MinWorkersExceedCount { min: usize, count: usize },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),

    #[error("Invalid DIF directory entry '{0}', expected app=dif")]
    InvalidDirectoryEntry(String),
}

impl ManagerConfig {
    /// Reject configurations the manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = &self.workers;
        if workers.count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if workers.min_workers > workers.count {
            return Err(ConfigError::MinWorkersExceedCount {
                min: workers.min_workers,
                count: workers.count,
            });
        }
        if workers.join_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("workers.join_timeout"));
        }
        if workers.idle_poll.is_zero() {
            return Err(ConfigError::ZeroDuration("workers.idle_poll"));
        }
        if self.correlator.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("correlator.request_timeout"));
        }
        if self.source.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("source.queue_capacity"));
        }
        if self.source.max_buffered_events == 0 {
            return Err(ConfigError::ZeroCapacity("source.max_buffered_events"));
        }
        if self.loopback.event_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("loopback.event_capacity"));
        }
        Ok(())
    }

    /// DIF configured for `application`, if any.
    #[must_use]
    pub fn dif_for(&self, application: &ApplicationName) -> Option<DifName> {
        self.dif_directory.get(&application.process_name).cloned()
    }

    /// Apply overrides from `lookup` (normally the process environment).
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(count) = parse_var::<usize>(&lookup, "IPCM_WORKERS") {
            self.workers.count = count;
        }
        if let Some(min) = parse_var::<usize>(&lookup, "IPCM_MIN_WORKERS") {
            self.workers.min_workers = min;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "IPCM_JOIN_TIMEOUT_MS") {
            self.workers.join_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "IPCM_REQUEST_TIMEOUT_MS") {
            self.correlator.request_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "IPCM_QUEUE_CAPACITY") {
            self.source.queue_capacity = capacity;
        }
        if let Some(raw) = lookup("IPCM_DIF_DIRECTORY") {
            match parse_dif_directory(&raw) {
                Ok(directory) => {
                    info!(entries = directory.len(), "Loaded DIF directory from environment");
                    self.dif_directory.extend(directory);
                }
                Err(e) => warn!("IPCM_DIF_DIRECTORY ignored: {}", e),
            }
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{} has an invalid value '{}', keeping default", name, raw);
            None
        }
    }
}

/// Parse `app=dif,app2=dif2`.
pub fn parse_dif_directory(raw: &str) -> Result<BTreeMap<String, DifName>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((app, dif)) if !app.trim().is_empty() && !dif.trim().is_empty() => {
                Ok((app.trim().to_string(), DifName::new(dif.trim())))
            }
            _ => Err(ConfigError::InvalidDirectoryEntry(entry.to_string())),
        })
        .collect()
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads.
    pub count: usize,
    /// Fewer successfully spawned workers than this aborts `start()`.
    pub min_workers: usize,
    /// Default bound on joining workers during `stop()`.
    pub join_timeout: Duration,
    /// Longest single wait on the native event source.
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: num_cpus::get().max(1),
            min_workers: 1,
            join_timeout: Duration::from_secs(5),
            idle_poll: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
        }
    }
}

/// Pending request configuration.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Age after which a pending request resolves as `Timeout`.
    pub request_timeout: Duration,
    /// Minimum spacing of opportunistic sweeps.
    pub sweep_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Event source configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Bound on locally injected events.
    pub queue_capacity: usize,
    /// Bound on events read and startable right away. Events queued behind a
    /// running handler of their own key are bounded at four times this.
    pub max_buffered_events: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_buffered_events: 4 * DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Loopback runtime configuration.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Bound on the loopback's native record queue.
    pub event_capacity: usize,
    /// Answer every issued call with a successful completion.
    pub auto_complete: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_QUEUE_CAPACITY,
            auto_complete: true,
        }
    }
}
