//! Configuration types.
//!
//! All types implement [`Default`] for compile-time fallback values.

use cinder_types::EnginePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure.
///
/// This is the unified configuration after merging all layers.
///
/// # Example
///
/// ```
/// use cinder_engine::config::CinderConfig;
///
/// let config = CinderConfig::default();
/// assert!(!config.debug);
/// assert_eq!(config.logging.level, "warn");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CinderConfig {
    /// Enable debug mode (debug logging, forced-debug binding).
    pub debug: bool,

    /// Engine configuration.
    pub engine: EngineConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl CinderConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes to TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Applies one config file layer on top of this config.
    ///
    /// Every field the layer sets overrides the current value, including
    /// values equal to the defaults.
    pub fn apply(&mut self, layer: &ConfigLayer) {
        if let Some(debug) = layer.debug {
            self.debug = debug;
        }

        self.engine.apply(&layer.engine);
        self.logging.apply(&layer.logging);
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Lua heap limit per engine, in MiB (`None` or `0` = unlimited).
    pub memory_limit_mb: Option<u64>,

    /// Module search paths appended after each command's own paths.
    pub search_paths: Vec<PathBuf>,

    /// Run a full collection after every invocation, not only for
    /// full-isolation engines.
    pub collect_on_release: bool,

    /// Policy used when a command does not ask for one.
    pub default_policy: EnginePolicy,
}

impl EngineConfig {
    /// Memory limit in bytes.
    #[must_use]
    pub fn memory_limit_bytes(&self) -> Option<usize> {
        self.memory_limit_mb
            .filter(|mb| *mb > 0)
            .map(|mb| usize::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX))
    }

    fn apply(&mut self, layer: &EngineLayer) {
        if let Some(mb) = layer.memory_limit_mb {
            self.memory_limit_mb = (mb > 0).then_some(mb);
        }
        if let Some(ref paths) = layer.search_paths {
            self.search_paths = paths.clone();
        }
        if let Some(collect) = layer.collect_on_release {
            self.collect_on_release = collect;
        }
        if let Some(policy) = layer.default_policy {
            self.default_policy = policy;
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when neither flags nor `RUST_LOG` set one.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
        }
    }
}

impl LoggingConfig {
    fn apply(&mut self, layer: &LoggingLayer) {
        if let Some(ref level) = layer.level {
            self.level = level.clone();
        }
    }
}

// =============================================================================
// File layers
// =============================================================================

/// One config file as written: only the keys present in the file are set.
///
/// # Example
///
/// ```
/// use cinder_engine::config::{CinderConfig, ConfigLayer};
/// use cinder_types::EnginePolicy;
///
/// let mut config = CinderConfig::default();
/// config.engine.default_policy = EnginePolicy::Clean;
///
/// let layer = ConfigLayer::from_toml("[engine]\ndefault_policy = \"reuse\"\n").expect("parse");
/// config.apply(&layer);
/// assert_eq!(config.engine.default_policy, EnginePolicy::Reuse);
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfigLayer {
    pub debug: Option<bool>,
    pub engine: EngineLayer,
    pub logging: LoggingLayer,
}

impl ConfigLayer {
    /// Deserializes a layer from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

/// `[engine]` keys of one layer.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineLayer {
    /// `0` resets the limit to unlimited.
    pub memory_limit_mb: Option<u64>,
    pub search_paths: Option<Vec<PathBuf>>,
    pub collect_on_release: Option<bool>,
    pub default_policy: Option<EnginePolicy>,
}

/// `[logging]` keys of one layer.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingLayer {
    pub level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = CinderConfig::default();
        assert!(!config.debug);
        assert_eq!(config.engine.memory_limit_mb, None);
        assert!(config.engine.search_paths.is_empty());
        assert_eq!(config.engine.default_policy, EnginePolicy::Reuse);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn parse_partial_toml() {
        let config = CinderConfig::from_toml(
            r#"
debug = true

[engine]
memory_limit_mb = 128
default_policy = "full-isolation"
"#,
        )
        .expect("parse");

        assert!(config.debug);
        assert_eq!(config.engine.memory_limit_mb, Some(128));
        assert_eq!(config.engine.default_policy, EnginePolicy::FullIsolation);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn toml_round_trip() {
        let mut config = CinderConfig::default();
        config.engine.search_paths = vec![PathBuf::from("/lib/lua")];
        config.logging.level = "debug".into();

        let text = config.to_toml().expect("serialize");
        let parsed = CinderConfig::from_toml(&text).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn empty_layer_keeps_base() {
        let mut base = CinderConfig::default();
        base.debug = true;
        base.engine.memory_limit_mb = Some(64);

        base.apply(&ConfigLayer::default());
        assert!(base.debug);
        assert_eq!(base.engine.memory_limit_mb, Some(64));
    }

    #[test]
    fn layer_overrides_set_keys() {
        let mut base = CinderConfig::default();
        base.engine.search_paths = vec![PathBuf::from("/global")];

        let layer = ConfigLayer::from_toml(
            r#"
[engine]
search_paths = ["/project"]
collect_on_release = true

[logging]
level = "info"
"#,
        )
        .expect("parse");

        base.apply(&layer);
        assert_eq!(base.engine.search_paths, vec![PathBuf::from("/project")]);
        assert!(base.engine.collect_on_release);
        assert_eq!(base.logging.level, "info");
    }

    #[test]
    fn layer_can_reset_to_default_values() {
        let mut base = CinderConfig::default();
        base.debug = true;
        base.engine.default_policy = EnginePolicy::Clean;
        base.engine.memory_limit_mb = Some(64);
        base.engine.search_paths = vec![PathBuf::from("/global")];

        let layer = ConfigLayer::from_toml(
            r#"
debug = false

[engine]
default_policy = "reuse"
memory_limit_mb = 0
search_paths = []
"#,
        )
        .expect("parse");

        base.apply(&layer);
        assert!(!base.debug);
        assert_eq!(base.engine.default_policy, EnginePolicy::Reuse);
        assert_eq!(base.engine.memory_limit_mb, None);
        assert!(base.engine.search_paths.is_empty());
    }

    #[test]
    fn memory_limit_in_bytes() {
        let engine = EngineConfig {
            memory_limit_mb: Some(2),
            ..EngineConfig::default()
        };
        assert_eq!(engine.memory_limit_bytes(), Some(2 * 1024 * 1024));
        assert_eq!(EngineConfig::default().memory_limit_bytes(), None);

        let zero = EngineConfig {
            memory_limit_mb: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(zero.memory_limit_bytes(), None);
    }
}
