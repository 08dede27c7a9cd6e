//! Configuration loader with hierarchical merging.
//!
//! # Load Order
//!
//! 1. Default values (compile-time)
//! 2. Global config (`~/.cinder/config.toml`)
//! 3. Project config (`.cinder/config.toml`)
//! 4. Environment variables (`CINDER_*`)
//!
//! Each layer overrides the previous.

use super::{
    default_config_path, CinderConfig, ConfigError, ConfigLayer, PROJECT_CONFIG_DIR,
    PROJECT_CONFIG_FILE,
};
use cinder_types::EnginePolicy;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Helper macro for parsing boolean environment variables.
macro_rules! parse_env_bool {
    ($lookup:expr, $field:expr, $var:literal) => {
        if let Some(val) = $lookup($var) {
            $field = parse_bool(&val)
                .ok_or_else(|| ConfigError::invalid_env_var($var, "expected bool"))?;
        }
    };
}

/// Configuration loader with builder pattern.
///
/// # Example
///
/// ```
/// use cinder_engine::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .skip_global_config()
///     .skip_env_vars()
///     .load()
///     .expect("defaults always load");
/// assert!(!config.debug);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Global config file path (defaults to ~/.cinder/config.toml).
    global_config_path: Option<PathBuf>,

    /// Project root directory.
    project_root: Option<PathBuf>,

    skip_env: bool,
    skip_global: bool,
    skip_project: bool,
}

impl ConfigLoader {
    /// Creates a new loader with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a custom global config path.
    #[must_use]
    pub fn with_global_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_path = Some(path.into());
        self
    }

    /// Sets the project root directory.
    ///
    /// Project config will be loaded from `<project_root>/.cinder/config.toml`.
    #[must_use]
    pub fn with_project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = Some(path.into());
        self
    }

    /// Skips environment variable loading.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Skips global config loading.
    #[must_use]
    pub fn skip_global_config(mut self) -> Self {
        self.skip_global = true;
        self
    }

    /// Skips project config loading.
    #[must_use]
    pub fn skip_project_config(mut self) -> Self {
        self.skip_project = true;
        self
    }

    /// Loads and merges configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any config file exists but cannot be parsed,
    /// or an environment variable holds an invalid value.
    /// Missing config files are silently ignored.
    pub fn load(&self) -> Result<CinderConfig, ConfigError> {
        let mut config = CinderConfig::default();

        // Layer 1: Global config
        if !self.skip_global {
            let global_path = self
                .global_config_path
                .clone()
                .unwrap_or_else(default_config_path);

            if let Some(global_config) = load_file(&global_path)? {
                debug!(path = %global_path.display(), "Loaded global config");
                config.apply(&global_config);
            }
        }

        // Layer 2: Project config
        if !self.skip_project {
            if let Some(ref project_root) = self.project_root {
                let project_config_path = project_root
                    .join(PROJECT_CONFIG_DIR)
                    .join(PROJECT_CONFIG_FILE);

                if let Some(project_config) = load_file(&project_config_path)? {
                    debug!(
                        path = %project_config_path.display(),
                        project = %project_root.display(),
                        "Loaded project config"
                    );
                    config.apply(&project_config);
                }
            }
        }

        // Layer 3: Environment variables
        if !self.skip_env {
            apply_env_vars(&mut config, |name| std::env::var(name).ok())?;
        }

        Ok(config)
    }
}

/// Loads a config file layer, returning None if it doesn't exist.
fn load_file(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
    let layer = ConfigLayer::from_toml(&content).map_err(|e| ConfigError::parse_toml(path, e))?;
    Ok(Some(layer))
}

/// Applies environment variable overrides read through `lookup`.
fn apply_env_vars<F>(config: &mut CinderConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_env_bool!(lookup, config.debug, "CINDER_DEBUG");
    parse_env_bool!(lookup, config.engine.collect_on_release, "CINDER_FULL_GC");

    if let Some(val) = lookup("CINDER_MEMORY_LIMIT_MB") {
        let trimmed = val.trim();
        config.engine.memory_limit_mb = if trimmed.is_empty() || trimmed == "0" {
            None
        } else {
            Some(trimmed.parse().map_err(|_| {
                ConfigError::invalid_env_var("CINDER_MEMORY_LIMIT_MB", "expected integer")
            })?)
        };
    }

    if let Some(val) = lookup("CINDER_POLICY") {
        config.engine.default_policy = val
            .parse::<EnginePolicy>()
            .map_err(|e| ConfigError::invalid_env_var("CINDER_POLICY", e.to_string()))?;
    }

    if let Some(val) = lookup("CINDER_SEARCH_PATH") {
        config.engine.search_paths = std::env::split_paths(&val)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
    }

    if let Some(val) = lookup("CINDER_LOG_LEVEL") {
        config.logging.level = val;
    }

    Ok(())
}

/// Parses a boolean from string.
///
/// Accepts: "true", "false", "1", "0", "yes", "no", "on", "off" (case-insensitive).
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
