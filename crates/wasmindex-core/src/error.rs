//! Error types for the wasmindex pipeline.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conflict/deadlock-class failure worth retrying.
    #[error("transient database error: {0}")]
    Transient(String),

    /// Database failure that survived retries — halts the pipeline.
    #[error("database error: {0}")]
    Fatal(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns `true` if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors raised while parsing a single stream record.
///
/// All of these are per-record: the ingestion driver reports and skips.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("missing required field: {field}")]
    SchemaMismatch { field: String },

    #[error("invalid base64 in {field}: {reason}")]
    Base64 { field: String, reason: String },

    #[error("value is not valid UTF-8")]
    Utf8,

    #[error("invalid canonical key: {0}")]
    Key(String),
}

/// Errors raised during formula evaluation.
#[derive(Debug, Error)]
pub enum FormulaError {
    #[error("unknown formula '{0}'")]
    UnknownFormula(String),

    #[error("formula '{formula}' does not support contract '{contract}'")]
    UnsupportedContract { formula: String, contract: String },

    #[error("missing required arg '{0}'")]
    MissingArg(String),

    #[error("invalid arg '{arg}': {reason}")]
    InvalidArg { arg: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

/// Errors surfaced to query callers.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown formula '{0}'")]
    UnknownFormula(String),

    #[error("contract '{0}' not found")]
    ContractNotFound(String),

    #[error("no events indexed for contract '{0}'")]
    NoEvents(String),

    #[error("block {requested} not yet indexed (latest is {latest})")]
    NotYetIndexed { requested: u64, latest: u64 },

    #[error("formula error: {0}")]
    Formula(#[from] FormulaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the ingestion driver.
///
/// Per-record problems are handled inside the driver; anything surfacing
/// here halts the pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("search reindex failed: {0}")]
    Search(String),

    #[error("{0}")]
    Other(String),
}
