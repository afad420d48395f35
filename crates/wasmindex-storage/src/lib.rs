//! wasmindex-storage — storage backends for the wasmindex pipeline.
//!
//! Two implementations of the [`wasmindex_core::store::Storage`] surface:
//! - [`MemoryStorage`] — everything in RAM, for tests and ephemeral runs
//! - [`PostgresStorage`] — production backend over `sqlx`

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::{PostgresOptions, PostgresStorage};
