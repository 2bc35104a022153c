//! Error taxonomy for the engine.
//!
//! Every failure surfaces with a stable kind tag so the HTTP layer can map it
//! to a status code without string matching. Nothing in the core retries.

use thiserror::Error;

/// Engine-wide error type with stable kinds.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input: wrong dims, non-finite floats, bad k, unknown index type.
    #[error("validation: {0}")]
    Validation(String),

    /// A library, document, or chunk id that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation incompatible with current state (e.g. IVF not trained).
    #[error("invalid state: {0}")]
    State(String),

    /// Attempt to mutate an immutable field (dims, index kind).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Embedding provider or persistence adapter failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Deadline exceeded or client disconnect.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Recovery has not completed yet.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Stable machine-readable tag for logs and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::State(_) => "state",
            EngineError::Conflict(_) => "conflict",
            EngineError::Upstream(_) => "upstream",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::Unavailable(_) => "unavailable",
        }
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).kind(), "validation");
        assert_eq!(EngineError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(EngineError::State("x".into()).kind(), "state");
        assert_eq!(EngineError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(EngineError::Upstream("x".into()).kind(), "upstream");
        assert_eq!(EngineError::Cancelled("x".into()).kind(), "cancelled");
        assert_eq!(EngineError::Unavailable("x".into()).kind(), "unavailable");
    }
}
