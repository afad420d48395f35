//! wasmindex-engine — formula runtime, computation cache, and ingestion
//! driver.
//!
//! The pipeline: a line stream feeds [`IngestDriver`], which persists
//! events through a [`wasmindex_core::store::Storage`], derives
//! transformations, invalidates the [`ComputationCache`], and enqueues
//! webhooks. [`QueryEngine`] serves formula reads through the same cache.

pub mod cache;
pub mod driver;
pub mod formulas;
pub mod query;
pub mod runtime;
pub mod search;
pub mod source;

pub use cache::{ComputationCache, InvalidationStats};
pub use driver::{IngestDriver, IngestStats};
pub use query::QueryEngine;
pub use runtime::{block_env_at, Evaluation, Formula, FormulaEnv, FormulaRegistry};
pub use search::{NoopSearchIndexer, RecordingSearchIndexer, SearchIndexer};
pub use source::WasmSource;
