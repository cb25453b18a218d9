//! Domain-level error taxonomy for skillet.

use std::path::PathBuf;

use crate::cache::CacheError;
use crate::model::ModelError;

/// Errors produced while validating eval definitions.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("eval {source_id} missing required field: {field}")]
    MissingField { source_id: String, field: String },

    #[error("eval {source_id} is not valid YAML: {reason}")]
    Malformed { source_id: String, reason: String },
}

/// Skillet domain errors.
#[derive(Debug, thiserror::Error)]
pub enum SkilletError {
    #[error("no evals found: {0}")]
    NoEvals(String),

    #[error("skill not found: {0}")]
    SkillNotFound(PathBuf),

    #[error("invalid eval: {0}")]
    Validation(#[from] ValidationError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("search error: {0}")]
    Search(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for skillet domain operations.
pub type Result<T> = std::result::Result<T, SkilletError>;
