//! Error types for webhook evaluation and delivery.

use thiserror::Error;

use wasmindex_core::error::StoreError;

#[derive(Debug, Error)]
pub enum WebhookError {
    /// A subscription's value resolution failed. Isolated per subscription:
    /// other subscriptions still run.
    #[error("value evaluation failed: {0}")]
    Eval(String),

    /// A delivery attempt failed; the pending row is retained with an
    /// incremented failure count.
    #[error("delivery failed (status {status:?}): {reason}")]
    Delivery {
        status: Option<u16>,
        reason: String,
    },

    #[error("soketi endpoint used but no soketi connection is configured")]
    SoketiNotConfigured,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
