//! Engine selection policy.

use crate::error::ParsePolicyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How an invocation obtains its interpreter instance.
///
/// | Policy | New engine | Cached afterwards | Frame mode |
/// |--------|-----------|-------------------|------------|
/// | `FullIsolation` | always | never | full |
/// | `Clean` | always | never | lightweight |
/// | `Refresh` | always | replaces entry | lightweight |
/// | `Reuse` | on cache miss | yes | lightweight |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnginePolicy {
    /// Brand-new engine that keeps no frames alive between invocations.
    FullIsolation,
    /// Brand-new default engine, used once.
    Clean,
    /// Brand-new default engine that replaces the cached one.
    Refresh,
    /// Cached engine for the key, created on first use.
    #[default]
    Reuse,
}

impl EnginePolicy {
    /// Derives the policy from the three legacy command flags.
    ///
    /// The flags are not independent: they are checked in the order
    /// full-isolation, clean, refresh, and the first one set wins.
    ///
    /// ```
    /// use cinder_types::EnginePolicy;
    ///
    /// assert_eq!(EnginePolicy::from_flags(true, true, true), EnginePolicy::FullIsolation);
    /// assert_eq!(EnginePolicy::from_flags(false, false, true), EnginePolicy::Refresh);
    /// assert_eq!(EnginePolicy::from_flags(false, false, false), EnginePolicy::Reuse);
    /// ```
    #[must_use]
    pub fn from_flags(full_isolation: bool, clean: bool, refresh: bool) -> Self {
        if full_isolation {
            Self::FullIsolation
        } else if clean {
            Self::Clean
        } else if refresh {
            Self::Refresh
        } else {
            Self::Reuse
        }
    }

    /// Returns true if the engine ends up stored in the cache.
    #[must_use]
    pub fn uses_cache(&self) -> bool {
        matches!(self, Self::Refresh | Self::Reuse)
    }

    /// Returns true if the policy always constructs a new engine.
    #[must_use]
    pub fn always_creates(&self) -> bool {
        !matches!(self, Self::Reuse)
    }

    /// Returns the canonical name used in configuration and on the CLI.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullIsolation => "full-isolation",
            Self::Clean => "clean",
            Self::Refresh => "refresh",
            Self::Reuse => "reuse",
        }
    }
}

impl fmt::Display for EnginePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnginePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "full-isolation" | "fullframe" | "full-frame" => Ok(Self::FullIsolation),
            "clean" => Ok(Self::Clean),
            "refresh" => Ok(Self::Refresh),
            "reuse" | "cached" => Ok(Self::Reuse),
            _ => Err(ParsePolicyError::new(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_priority_order() {
        // full-isolation beats everything
        assert_eq!(
            EnginePolicy::from_flags(true, false, false),
            EnginePolicy::FullIsolation
        );
        assert_eq!(
            EnginePolicy::from_flags(true, true, false),
            EnginePolicy::FullIsolation
        );
        assert_eq!(
            EnginePolicy::from_flags(true, false, true),
            EnginePolicy::FullIsolation
        );

        // clean beats refresh
        assert_eq!(
            EnginePolicy::from_flags(false, true, true),
            EnginePolicy::Clean
        );
        assert_eq!(
            EnginePolicy::from_flags(false, true, false),
            EnginePolicy::Clean
        );

        assert_eq!(
            EnginePolicy::from_flags(false, false, true),
            EnginePolicy::Refresh
        );
        assert_eq!(
            EnginePolicy::from_flags(false, false, false),
            EnginePolicy::Reuse
        );
    }

    #[test]
    fn cache_usage() {
        assert!(!EnginePolicy::FullIsolation.uses_cache());
        assert!(!EnginePolicy::Clean.uses_cache());
        assert!(EnginePolicy::Refresh.uses_cache());
        assert!(EnginePolicy::Reuse.uses_cache());

        assert!(EnginePolicy::Refresh.always_creates());
        assert!(!EnginePolicy::Reuse.always_creates());
    }

    #[test]
    fn parse_round_trips_canonical_names() {
        for policy in [
            EnginePolicy::FullIsolation,
            EnginePolicy::Clean,
            EnginePolicy::Refresh,
            EnginePolicy::Reuse,
        ] {
            let parsed: EnginePolicy = policy.as_str().parse().expect("canonical name parses");
            assert_eq!(parsed, policy);
        }
    }

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!(
            "FULL_ISOLATION".parse::<EnginePolicy>(),
            Ok(EnginePolicy::FullIsolation)
        );
        assert_eq!(
            "fullframe".parse::<EnginePolicy>(),
            Ok(EnginePolicy::FullIsolation)
        );
        assert_eq!("cached".parse::<EnginePolicy>(), Ok(EnginePolicy::Reuse));
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = "sometimes".parse::<EnginePolicy>().unwrap_err();
        assert_eq!(err.input, "sometimes");
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn default_is_reuse() {
        assert_eq!(EnginePolicy::default(), EnginePolicy::Reuse);
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&EnginePolicy::FullIsolation).expect("serialize");
        assert_eq!(json, "\"full-isolation\"");
    }
}
