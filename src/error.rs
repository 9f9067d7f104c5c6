// 🚨 Error taxonomy for the transform run
//
// Per-record defects never show up here: they become diagnostics or rejected
// rows. Everything in this file halts the run.

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// SOURCE READER ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source file for table '{table}' not found at {path}")]
    NotFound { table: String, path: PathBuf },

    #[error("could not read source file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt or unreadable file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("table '{table}' is missing required column '{column}'")]
    SchemaMismatch { table: String, column: String },
}

// ============================================================================
// SINK / CHECKPOINT ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("output I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("could not flush buffered output for '{table}': {source}")]
    Buffer {
        table: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rows of '{table}' serialize as {found:?} but declare {declared:?}")]
    ColumnMismatch {
        table: String,
        declared: Vec<String>,
        found: Vec<String>,
    },

    #[error("snapshot payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("checkpoint snapshot '{table}' failed schema check: expected {expected}, found {found}")]
    SchemaFingerprint {
        table: String,
        expected: String,
        found: String,
    },

    #[error("checkpoint timestamp could not be parsed: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("checkpoint column list is not valid JSON: {0}")]
    Columns(#[from] serde_json::Error),

    #[error("checkpoint snapshot could not be encoded: {0}")]
    Snapshot(#[from] SinkError),
}

// ============================================================================
// PIPELINE (STRUCTURAL) ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("required source table '{0}' was not provided")]
    MissingTable(String),

    #[error("source table '{0}' has no records")]
    EmptySource(String),

    #[error("join fan-out: table '{table}' has {count} rows with key {key}")]
    DuplicateKey {
        table: String,
        key: String,
        count: usize,
    },

    #[error("cardinality check failed at {stage}: expected {expected} rows, accounted for {actual}")]
    CardinalityMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },

    #[error("all {count} rows of table '{table}' were rejected")]
    TotalRejection { table: String, count: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
