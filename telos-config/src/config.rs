// Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(String),
    /// File was not valid TOML for the schema
    #[error("Parse error: {0}")]
    Parse(String),
    /// A value was out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The recognized configuration surface of the runtime.
///
/// Field names match the external option names one-to-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelosConfig {
    /// Directory holding the L3 database and the L2 index file set
    pub data_dir: PathBuf,

    /// Number of compute workers
    pub workers: usize,

    /// Bounded task queue capacity
    pub queue_capacity: usize,

    /// Worker liveness ping interval ceiling (milliseconds)
    pub worker_heartbeat_ms: u64,

    /// Resubmissions of an in-flight task after a worker crash
    pub worker_retry: u32,

    /// L1 vector cache capacity in bytes
    pub l1_capacity_bytes: usize,

    /// L2 graph degree (max neighbors per node)
    pub l2_graph_degree: usize,

    /// L2 beam width for search and construction
    pub l2_beam_width: usize,

    /// L2 pruning slack factor
    pub l2_alpha: f64,

    /// Coordinator lease duration over pending outbox records (milliseconds)
    pub outbox_lease_ms: u64,

    /// Initial outbox retry backoff (milliseconds)
    pub outbox_backoff_base_ms: u64,

    /// Outbox retry backoff cap (milliseconds)
    pub outbox_backoff_max_ms: u64,

    /// Attempts before an outbox record goes to the dead letter state
    pub outbox_max_attempts: u32,

    /// Maximum decision phases per cognitive cycle
    pub cycle_iteration_limit: u64,

    /// Wall-clock budget per cognitive cycle (milliseconds)
    pub cycle_wall_ms: u64,

    /// Result confidence at which a cycle terminates successfully, in [0,1]
    pub theta_success: f64,

    /// Confidence floor below which an operator result counts as
    /// "no confident result", in [0,1]
    pub theta_disc: f64,

    /// Free energy threshold for adaptation triggering
    pub free_energy_threshold: f64,

    /// Consecutive above-threshold samples required before adapting
    pub free_energy_dwell_samples: u32,

    /// Include worker traces in user-visible failures
    pub verbose_errors: bool,
}

impl Default for TelosConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./telos-data"),
            workers: 4,
            queue_capacity: 1024,
            worker_heartbeat_ms: 1000,
            worker_retry: 2,
            l1_capacity_bytes: 64 * 1024 * 1024,
            l2_graph_degree: 16,
            l2_beam_width: 64,
            l2_alpha: 1.2,
            outbox_lease_ms: 5000,
            outbox_backoff_base_ms: 50,
            outbox_backoff_max_ms: 5000,
            outbox_max_attempts: 5,
            cycle_iteration_limit: 64,
            cycle_wall_ms: 30_000,
            theta_success: 0.9,
            theta_disc: 0.2,
            free_energy_threshold: 1.5,
            free_energy_dwell_samples: 3,
            verbose_errors: false,
        }
    }
}

impl TelosConfig {
    /// Set the data directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the worker retry budget
    pub fn with_worker_retry(mut self, retries: u32) -> Self {
        self.worker_retry = retries;
        self
    }

    /// Set the cognitive cycle budgets
    pub fn with_cycle_budget(mut self, iterations: u64, wall_ms: u64) -> Self {
        self.cycle_iteration_limit = iterations;
        self.cycle_wall_ms = wall_ms;
        self
    }

    /// Validate ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be >= 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be >= 1".into()));
        }
        for (name, value) in [
            ("theta_success", self.theta_success),
            ("theta_disc", self.theta_disc),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} = {value} outside [0,1]"
                )));
            }
        }
        if self.outbox_backoff_base_ms > self.outbox_backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "outbox_backoff_base_ms {} exceeds cap {}",
                self.outbox_backoff_base_ms, self.outbox_backoff_max_ms
            )));
        }
        if self.outbox_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "outbox_max_attempts must be >= 1".into(),
            ));
        }
        if self.l2_graph_degree < 2 {
            return Err(ConfigError::Invalid("l2_graph_degree must be >= 2".into()));
        }
        if self.l2_alpha < 1.0 {
            return Err(ConfigError::Invalid("l2_alpha must be >= 1.0".into()));
        }
        if self.free_energy_dwell_samples == 0 {
            return Err(ConfigError::Invalid(
                "free_energy_dwell_samples must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from `path` (when present) and environment variables.
///
/// Loading hierarchy: env > file > defaults.
pub fn load_config(path: Option<&Path>) -> Result<TelosConfig, ConfigError> {
    let mut config = match path {
        Some(p) if p.exists() => load_from_file(p)?,
        _ => TelosConfig::default(),
    };

    crate::env::apply_env_overrides(&mut config)?;
    config.validate()?;

    debug!(workers = config.workers, queue = config.queue_capacity, "configuration loaded");
    Ok(config)
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path) -> Result<TelosConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        TelosConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_workers() {
        let config = TelosConfig::default().with_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_theta_out_of_range() {
        let mut config = TelosConfig::default();
        config.theta_success = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_backoff_base_over_cap() {
        let mut config = TelosConfig::default();
        config.outbox_backoff_base_ms = 10_000;
        config.outbox_backoff_max_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers = 8\nqueue_capacity = 16").unwrap();
        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.worker_retry, 2);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/telos.toml"))).unwrap();
        assert_eq!(config.workers, 4);
    }
}
