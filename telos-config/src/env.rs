// Environment variable overrides (TELOS_* namespace)

use crate::config::{ConfigError, TelosConfig};
use std::path::PathBuf;

macro_rules! override_parsed {
    ($config:expr, $field:ident, $var:expr, $ty:ty) => {
        if let Ok(raw) = std::env::var($var) {
            $config.$field = raw.parse::<$ty>().map_err(|_| {
                ConfigError::Invalid(format!("{}={raw} is not a valid value", $var))
            })?;
        }
    };
}

/// Apply `TELOS_*` environment variable overrides to a configuration.
///
/// Unset variables leave the corresponding field untouched; set-but-invalid
/// variables are an error rather than a silent fallback.
pub fn apply_env_overrides(config: &mut TelosConfig) -> Result<(), ConfigError> {
    if let Ok(dir) = std::env::var("TELOS_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
    }

    override_parsed!(config, workers, "TELOS_WORKERS", usize);
    override_parsed!(config, queue_capacity, "TELOS_QUEUE_CAPACITY", usize);
    override_parsed!(config, worker_heartbeat_ms, "TELOS_WORKER_HEARTBEAT_MS", u64);
    override_parsed!(config, worker_retry, "TELOS_WORKER_RETRY", u32);
    override_parsed!(config, l1_capacity_bytes, "TELOS_L1_CAPACITY_BYTES", usize);
    override_parsed!(config, l2_graph_degree, "TELOS_L2_GRAPH_DEGREE", usize);
    override_parsed!(config, l2_beam_width, "TELOS_L2_BEAM_WIDTH", usize);
    override_parsed!(config, l2_alpha, "TELOS_L2_ALPHA", f64);
    override_parsed!(config, outbox_lease_ms, "TELOS_OUTBOX_LEASE_MS", u64);
    override_parsed!(config, outbox_backoff_base_ms, "TELOS_OUTBOX_BACKOFF_BASE_MS", u64);
    override_parsed!(config, outbox_backoff_max_ms, "TELOS_OUTBOX_BACKOFF_MAX_MS", u64);
    override_parsed!(config, outbox_max_attempts, "TELOS_OUTBOX_MAX_ATTEMPTS", u32);
    override_parsed!(config, cycle_iteration_limit, "TELOS_CYCLE_ITERATION_LIMIT", u64);
    override_parsed!(config, cycle_wall_ms, "TELOS_CYCLE_WALL_MS", u64);
    override_parsed!(config, theta_success, "TELOS_THETA_SUCCESS", f64);
    override_parsed!(config, theta_disc, "TELOS_THETA_DISC", f64);
    override_parsed!(config, free_energy_threshold, "TELOS_FREE_ENERGY_THRESHOLD", f64);
    override_parsed!(
        config,
        free_energy_dwell_samples,
        "TELOS_FREE_ENERGY_DWELL_SAMPLES",
        u32
    );
    override_parsed!(config, verbose_errors, "TELOS_VERBOSE_ERRORS", bool);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env tests mutate process state; keep them in one test to avoid
    // interference under the parallel test runner.
    #[test]
    fn overrides_apply_and_reject_garbage() {
        std::env::set_var("TELOS_WORKERS", "9");
        std::env::set_var("TELOS_THETA_SUCCESS", "0.5");
        let mut config = TelosConfig::default();
        apply_env_overrides(&mut config).unwrap();
        assert_eq!(config.workers, 9);
        assert!((config.theta_success - 0.5).abs() < f64::EPSILON);

        std::env::set_var("TELOS_WORKERS", "many");
        let mut config = TelosConfig::default();
        assert!(apply_env_overrides(&mut config).is_err());

        std::env::remove_var("TELOS_WORKERS");
        std::env::remove_var("TELOS_THETA_SUCCESS");
    }
}
