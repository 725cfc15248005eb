//! Error types for the metricgrid data model.

use thiserror::Error;

use crate::schema::{MergeOperator, ValueType};

/// Result type alias for record operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// Errors raised while declaring schemas. Always fatal at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("schema {schema}: no columns declared")]
    EmptySchema { schema: String },

    #[error("schema {schema}: duplicate column {column}")]
    DuplicateColumn { schema: String, column: String },

    #[error("schema {schema}: column {column} of type {value_type} cannot use {operator} merge")]
    UnsupportedOperator {
        schema: String,
        column: String,
        value_type: ValueType,
        operator: MergeOperator,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while building, merging or decoding records.
///
/// A failed merge never leaves a record half-updated.
#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("schema mismatch: expected schema {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("key mismatch: {existing} cannot merge {incoming}")]
    KeyMismatch { existing: String, incoming: String },

    #[error("column {column}: expected {expected} value")]
    TypeMismatch { column: String, expected: ValueType },

    #[error("column {column}: arithmetic overflow")]
    Overflow { column: String },

    #[error("column count mismatch: schema has {expected}, payload has {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("column index {index} out of range")]
    ColumnOutOfRange { index: usize },

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("invalid time bucket {bucket}")]
    InvalidBucket { bucket: i64 },
}
