//! # TELOS Config - Configuration Management
//!
//! TOML-based configuration with environment variable overrides.
//!
//! Loading hierarchy: env > file > defaults. Every recognized option has a
//! default, so a bare `TelosConfig::default()` is a working configuration
//! for tests and embedded use.

pub mod config;
pub mod env;

pub use config::{load_config, load_from_file, ConfigError, TelosConfig};
pub use env::apply_env_overrides;
