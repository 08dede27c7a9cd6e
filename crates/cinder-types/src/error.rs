//! Error types for cinder-types.

use thiserror::Error;

/// Returned when a string does not name an [`EnginePolicy`](crate::EnginePolicy).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown engine policy '{input}' (expected one of: reuse, refresh, clean, full-isolation)")]
pub struct ParsePolicyError {
    /// The rejected input.
    pub input: String,
}

impl ParsePolicyError {
    /// Creates a parse error for the given input.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}
