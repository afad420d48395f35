//! wasmindex-core — domain types, key codec, store traits, and
//! transformation rules for the wasmindex pipeline.
//!
//! The crate is storage- and transport-agnostic: backends live in
//! `wasmindex-storage`, orchestration in `wasmindex-engine`, webhook
//! delivery in `wasmindex-webhooks`.

pub mod config;
pub mod dependency;
pub mod error;
pub mod keys;
pub mod store;
pub mod transform;
pub mod types;

pub use dependency::{Change, Dependency, DependencySet};
pub use error::{FormulaError, IngestError, ParseError, QueryError, StoreError};
pub use store::{
    ComputationStore, ComputationWithDeps, EventStore, StateStore, Storage, TransformationStore,
    WebhookQueue,
};
pub use types::{
    canonicalize_args, Block, BlockEnv, Computation, Contract, Endpoint, NewComputation,
    NewPendingWebhook, OutputRun, PendingWebhook, RawWasmEvent, State, StoredWasmEvent,
    Transformation, WasmEvent,
};
