//! Command identity metadata.

use crate::CacheKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identity of the command an invocation runs.
///
/// The host decides which script to run; this type only carries the
/// metadata that hosted scripts may introspect and the extension name that
/// groups commands into one engine cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Display name of the command.
    pub name: String,
    /// Bundle (button, panel, ...) the command belongs to.
    pub bundle: String,
    /// Extension (package) the command ships in. Used as cache key.
    pub extension: String,
    /// Unique id of the command within the host.
    pub unique_id: String,
    /// Primary script source file.
    pub script_source: PathBuf,
    /// Alternate script source, run on alternate invocation (e.g. shift-click).
    pub alternate_script_source: Option<PathBuf>,
}

impl CommandInfo {
    /// Creates command metadata with a name and primary script source.
    ///
    /// Bundle, extension and unique id start empty.
    #[must_use]
    pub fn new(name: impl Into<String>, script_source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script_source: script_source.into(),
            ..Self::default()
        }
    }

    /// Sets the bundle name.
    #[must_use]
    pub fn with_bundle(mut self, bundle: impl Into<String>) -> Self {
        self.bundle = bundle.into();
        self
    }

    /// Sets the extension name.
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Sets the unique id.
    #[must_use]
    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    /// Sets the alternate script source.
    #[must_use]
    pub fn with_alternate_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.alternate_script_source = Some(path.into());
        self
    }

    /// Returns the cache key: the extension name.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.extension.clone())
    }

    /// Directory containing the primary script.
    #[must_use]
    pub fn script_dir(&self) -> Option<&Path> {
        parent_dir(&self.script_source)
    }

    /// Directory containing the alternate script, if there is one.
    #[must_use]
    pub fn alternate_script_dir(&self) -> Option<&Path> {
        self.alternate_script_source.as_deref().and_then(parent_dir)
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}
