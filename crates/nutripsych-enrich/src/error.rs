//! Enrichment pipeline error types.

use nutripsych_db::DbError;
use nutripsych_llm::ServiceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EnrichError>;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("Template {template_id} is missing slot(s): {}", slots.join(", "))]
    MissingSlot { template_id: String, slots: Vec<String> },

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid template {template_id}: {reason}")]
    InvalidTemplate { template_id: String, reason: String },

    #[error("Template {template_id} has no known-answer fixture")]
    NoFixture { template_id: String },

    #[error("Template engine error: {0}")]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Schema mismatch: missing [{}], extraneous [{}], mistyped [{}]",
        missing.join(", "), extraneous.join(", "), mistyped.join(", "))]
    SchemaMismatch { missing: Vec<String>, extraneous: Vec<String>, mistyped: Vec<String> },

    #[error("Calibration output does not mirror its input: missing [{}], extraneous [{}], mistyped [{}]",
        missing.join(", "), extraneous.join(", "), mistyped.join(", "))]
    CalibrationShape { missing: Vec<String>, extraneous: Vec<String>, mistyped: Vec<String> },

    #[error("Commit conflict on {food_id}: expected version {expected}, found {actual}")]
    CommitConflict { food_id: String, expected: u64, actual: u64 },

    #[error("Store error: {0}")]
    Store(DbError),

    #[error("Template {template_id} v{version} failed its known-answer test")]
    UntrustedTemplate { template_id: String, version: String },

    #[error("Shutdown requested")]
    Cancelled,

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<DbError> for EnrichError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::CommitConflict { food_id, expected, actual } => {
                EnrichError::CommitConflict { food_id, expected, actual }
            }
            other => EnrichError::Store(other),
        }
    }
}
