//! Store error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Food record not found: {0}")]
    NotFound(String),

    #[error("Invalid food id: {0}")]
    InvalidId(String),

    /// The record changed between read and commit.
    #[error("Commit conflict on {food_id}: expected version {expected}, found {actual}")]
    CommitConflict { food_id: String, expected: u64, actual: u64 },
}
