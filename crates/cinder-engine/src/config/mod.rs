//! Configuration management with hierarchical layering.
//!
//! # Architecture
//!
//! ```text
//! Priority (highest to lowest):
//!
//! ┌───────────────────────────────────────────┐
//! │  1. Environment Variables (CINDER_*)      │  Runtime override
//! ├───────────────────────────────────────────┤
//! │  2. Project Config (.cinder/config.toml)  │  Project-specific
//! ├───────────────────────────────────────────┤
//! │  3. Global Config (~/.cinder/config.toml) │  User defaults
//! ├───────────────────────────────────────────┤
//! │  4. Default Values (compile-time)         │  Fallback
//! └───────────────────────────────────────────┘
//! ```
//!
//! Config files are read as [`ConfigLayer`]s: every key a file sets
//! overrides the layers below it, even when it equals the default.
//!
//! # Environment Variables
//!
//! | Variable | Config Field | Type |
//! |----------|--------------|------|
//! | `CINDER_DEBUG` | `debug` | bool |
//! | `CINDER_MEMORY_LIMIT_MB` | `engine.memory_limit_mb` | integer (`0` = unlimited) |
//! | `CINDER_FULL_GC` | `engine.collect_on_release` | bool |
//! | `CINDER_POLICY` | `engine.default_policy` | policy name |
//! | `CINDER_SEARCH_PATH` | `engine.search_paths` | OS path list |
//! | `CINDER_LOG_LEVEL` | `logging.level` | filter directive |
//!
//! # Example Configuration
//!
//! ```toml
//! # ~/.cinder/config.toml
//! debug = false
//!
//! [engine]
//! memory_limit_mb = 256
//! search_paths = ["~/.cinder/lib"]
//! collect_on_release = false
//! default_policy = "reuse"
//!
//! [logging]
//! level = "warn"
//! ```

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use types::{
    CinderConfig, ConfigLayer, EngineConfig, EngineLayer, LoggingConfig, LoggingLayer,
};

use std::path::PathBuf;

/// Project-local config directory name.
pub const PROJECT_CONFIG_DIR: &str = ".cinder";

/// Config file name inside config directories.
pub const PROJECT_CONFIG_FILE: &str = "config.toml";

/// Default global config directory.
#[must_use]
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PROJECT_CONFIG_DIR)
}

/// Default global config file path.
#[must_use]
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(PROJECT_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        let path = default_config_path();
        assert!(path.ends_with(".cinder/config.toml"));
    }
}
