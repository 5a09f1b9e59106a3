//! Error types for the readiness engine

use thiserror::Error;

/// Errors that can occur while computing readiness.
///
/// The engine is total for well-formed payloads: of these variants only
/// `InvalidPayload` is ever returned by the orchestrator. The remaining
/// variants surface from lower-level entry points (JSON loading, the CLI)
/// and are swallowed into graceful fallbacks inside the pipeline itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid payload field `{field}`: {reason}")]
    InvalidPayload { field: String, reason: String },

    #[error("invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("baseline store error: {0}")]
    BaselineStoreError(String),

    #[error("baseline version conflict for user {0}")]
    BaselineVersionConflict(String),

    #[error("personalization load error: {0}")]
    PersonalizationError(String),

    #[error("unknown evidence variable: {0}")]
    UnknownEvidenceVariable(String),

    #[error("unknown category `{category}` for evidence `{variable}`")]
    UnknownCategory { variable: String, category: String },
}

impl EngineError {
    /// Shorthand for a field-level payload rejection.
    pub fn invalid(field: &str, reason: &str) -> Self {
        EngineError::InvalidPayload {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}
