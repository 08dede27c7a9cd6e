//! Error types for engine lifecycle operations.

use cinder_types::EngineId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while creating, preparing or releasing engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lua runtime error.
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    /// The interpreter instance could not be constructed.
    #[error("engine construction failed: {0}")]
    Construction(String),

    /// A module search path cannot be expressed in `package.path`.
    #[error("invalid search path '{path}': {reason}")]
    InvalidSearchPath { path: PathBuf, reason: String },

    /// Script file does not exist.
    #[error("script not found: {0}")]
    ScriptNotFound(PathBuf),

    /// Script file exists but could not be read.
    #[error("failed to read script '{path}': {source}")]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stream guard was handed to an engine it was not created for.
    #[error("stream guard belongs to engine {guard}, not {engine}")]
    StreamGuardMismatch { guard: EngineId, engine: EngineId },

    /// The engine's current output is not the one the guard attached.
    ///
    /// Another redirection is still active on top of this one.
    #[error("out-of-order stream release on engine {engine}: a nested redirection is still attached")]
    StreamOutOfOrder { engine: EngineId },

    /// A binding guard was handed to an engine it was not created for.
    #[error("binding guard belongs to engine {guard}, not {engine}")]
    BindingGuardMismatch { guard: EngineId, engine: EngineId },

    /// The engine manager behind a script-side handle has been dropped.
    #[error("engine manager is no longer alive")]
    ManagerDropped,
}

impl EngineError {
    /// Creates a construction error.
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction(message.into())
    }

    /// Maps a script read failure, keeping "not found" distinct.
    pub fn script_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::ScriptNotFound(path)
        } else {
            Self::ScriptRead { path, source }
        }
    }

    /// Creates an invalid search path error.
    pub fn invalid_search_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidSearchPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<EngineError> for mlua::Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Lua(e) => e,
            other => mlua::Error::external(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EngineError::invalid_search_path("/a;b", "contains ';'");
        assert!(err.to_string().contains("/a;b"));
        assert!(err.to_string().contains("contains ';'"));

        let err = EngineError::construction("runtime unavailable");
        assert_eq!(
            err.to_string(),
            "engine construction failed: runtime unavailable"
        );
    }

    #[test]
    fn script_read_keeps_not_found_distinct() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            EngineError::script_read("/a.lua", missing),
            EngineError::ScriptNotFound(_)
        ));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = EngineError::script_read("/b.lua", denied);
        assert!(matches!(err, EngineError::ScriptRead { .. }));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("/b.lua"));
    }

    #[test]
    fn lua_error_round_trips_without_wrapping() {
        let err = EngineError::from(mlua::Error::RuntimeError("boom".into()));
        let back: mlua::Error = err.into();
        assert!(matches!(back, mlua::Error::RuntimeError(ref m) if m == "boom"));
    }
}
