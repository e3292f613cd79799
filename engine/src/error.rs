//! Error types for the stash engine.

use crate::TableName;
use thiserror::Error;

/// All possible errors from the stash engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("schema error: {0}")]
    Schema(String),

    // Record validation errors
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("record has no usable primary key in column '{0}'")]
    MissingPrimaryKey(String),

    #[error("value of column '{0}' cannot be used as an index key")]
    InvalidKey(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("value of field '{field}' exceeds length {length}")]
    ValueTooLong { field: String, length: usize },

    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    // Index errors
    #[error("duplicate key {key} in column '{column}' of table '{table}'")]
    DuplicateKey {
        table: TableName,
        column: String,
        key: String,
    },

    #[error("key {key} not found in table '{table}'")]
    NotFound { table: TableName, key: String },

    // Synch errors
    #[error("invalid synch response: {0}")]
    InvalidResponse(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
