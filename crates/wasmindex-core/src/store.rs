//! Storage traits for the pipeline.
//!
//! Implementations live in `wasmindex-storage`: an in-memory backend for
//! tests and ephemeral runs, and PostgreSQL for production.

use async_trait::async_trait;

use crate::dependency::{Change, Dependency};
use crate::error::StoreError;
use crate::types::{
    Computation, Contract, NewComputation, NewPendingWebhook, PendingWebhook, State,
    StoredWasmEvent, Transformation, WasmEvent,
};

/// A computation joined with its recorded dependency rows, as returned by
/// the reverse dependency lookup.
#[derive(Debug, Clone)]
pub struct ComputationWithDeps {
    pub computation: Computation,
    pub dependencies: Vec<Dependency>,
}

/// Raw event and contract persistence.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Upsert the contracts referenced by a batch. On address conflict only
    /// `code_id` is updated; the `instantiated_at_*` columns are write-once.
    ///
    /// Implementations retry the bulk operation up to 3 times on transient
    /// conflict/deadlock before failing the batch.
    async fn upsert_contracts(&self, batch: &[WasmEvent]) -> Result<Vec<Contract>, StoreError>;

    /// Bulk upsert events on the unique `(block_height, contract, key)`
    /// triple; conflicts replace `(value, value_json, deleted)`. Returns the
    /// final rows with contracts attached.
    async fn upsert_events(&self, batch: &[WasmEvent])
        -> Result<Vec<StoredWasmEvent>, StoreError>;

    /// Latest event row for `(contract, key)` at or before `at`.
    async fn latest_event_at(
        &self,
        contract: &str,
        key: &str,
        at: u64,
    ) -> Result<Option<WasmEvent>, StoreError>;

    /// Latest event per key under `prefix` at or before `at`, tombstoned
    /// keys dropped, ordered by key.
    async fn map_at(
        &self,
        contract: &str,
        prefix: &str,
        at: u64,
    ) -> Result<Vec<WasmEvent>, StoreError>;

    /// Earliest non-delete write for `(contract, key)`, if any.
    async fn first_set(&self, contract: &str, key: &str)
        -> Result<Option<WasmEvent>, StoreError>;

    /// Latest event for `(contract, key)` at a block strictly below
    /// `before`.
    async fn previous_event(
        &self,
        contract: &str,
        key: &str,
        before: u64,
    ) -> Result<Option<WasmEvent>, StoreError>;

    /// Distinct block heights in `[from, to]` carrying an event that
    /// intersects any of `deps`. Drives range evaluation.
    async fn event_heights_matching(
        &self,
        deps: &[Dependency],
        from: u64,
        to: u64,
    ) -> Result<Vec<u64>, StoreError>;

    /// Block time of the latest indexed event at or before `at`, used to pin
    /// evaluation environments to historical blocks.
    async fn latest_block_time_at(&self, at: u64) -> Result<Option<u64>, StoreError>;

    async fn contract(&self, address: &str) -> Result<Option<Contract>, StoreError>;

    async fn contract_has_events(&self, address: &str) -> Result<bool, StoreError>;
}

/// Derived transformation persistence.
#[async_trait]
pub trait TransformationStore: Send + Sync {
    /// Upsert on `(block_height, contract, name)`, last write wins. Returns
    /// the written rows.
    async fn upsert_transformations(
        &self,
        rows: &[Transformation],
    ) -> Result<Vec<Transformation>, StoreError>;

    /// Latest transformation value for `(contract, name)` at or before `at`.
    async fn latest_transformation_at(
        &self,
        contract: &str,
        name: &str,
        at: u64,
    ) -> Result<Option<Transformation>, StoreError>;
}

/// Cached computation persistence.
#[async_trait]
pub trait ComputationStore: Send + Sync {
    /// The row whose `[valid, latest]` range contains `at`, if any.
    async fn find_valid_at(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        at: u64,
    ) -> Result<Option<Computation>, StoreError>;

    /// The row with `block_height_latest == height`, used to extend a
    /// rightward-adjacent equal output instead of inserting.
    async fn ending_at(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        height: u64,
    ) -> Result<Option<Computation>, StoreError>;

    /// The row with the greatest `block_height_latest` strictly below
    /// `height`, used to widen proven-valid coverage on a read-through miss.
    async fn latest_computation_before(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        height: u64,
    ) -> Result<Option<Computation>, StoreError>;

    /// Insert a computation row, replacing its dependency rows atomically.
    async fn insert_computation(
        &self,
        computation: NewComputation,
        deps: &[Dependency],
    ) -> Result<Computation, StoreError>;

    /// Raise `block_height_latest` of an existing row.
    async fn extend_latest(&self, id: i64, new_latest: u64) -> Result<(), StoreError>;

    /// Swap a row's dependency set for a new one.
    async fn replace_dependencies(&self, id: i64, deps: &[Dependency]) -> Result<(), StoreError>;

    /// Lower `block_height_latest` of an existing row.
    async fn truncate_latest(&self, id: i64, new_latest: u64) -> Result<(), StoreError>;

    /// Delete a row and its dependencies.
    async fn destroy_computation(&self, id: i64) -> Result<(), StoreError>;

    /// Reverse lookup: computations whose dependency set intersects the
    /// change-set (prefix semantics), with their dependencies attached.
    async fn dependents_of(
        &self,
        changes: &[Change],
    ) -> Result<Vec<ComputationWithDeps>, StoreError>;
}

/// The singleton pipeline checkpoint.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state, zero-initialised on first use.
    async fn state(&self) -> Result<State, StoreError>;

    /// Monotonic-max advance of the checkpoint fields. `None` leaves a
    /// field untouched; a regressing value never wins.
    async fn advance_state(
        &self,
        last_exported: Option<u64>,
        latest: Option<(u64, u64)>,
    ) -> Result<State, StoreError>;
}

/// The pending webhook queue.
#[async_trait]
pub trait WebhookQueue: Send + Sync {
    async fn enqueue_webhooks(&self, rows: &[NewPendingWebhook]) -> Result<u64, StoreError>;

    /// Oldest pending rows, up to `limit`.
    async fn pending_webhooks(&self, limit: i64) -> Result<Vec<PendingWebhook>, StoreError>;

    /// Remove a delivered row.
    async fn delete_webhook(&self, id: i64) -> Result<(), StoreError>;

    /// Increment the failure counter, keeping the row. Returns the new
    /// count.
    async fn record_webhook_failure(&self, id: i64) -> Result<u32, StoreError>;
}

/// The full storage surface the pipeline runs against.
pub trait Storage:
    EventStore + TransformationStore + ComputationStore + StateStore + WebhookQueue
{
}

impl<T> Storage for T where
    T: EventStore + TransformationStore + ComputationStore + StateStore + WebhookQueue
{
}
