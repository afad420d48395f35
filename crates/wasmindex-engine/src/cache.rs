//! Computation cache with dependency-driven invalidation.
//!
//! Formula outputs are cached per `(formula, contract, canonical args)` as
//! disjoint block ranges. Reads fall through to the formula runtime and
//! persist their result; writes never recompute — ingestion only narrows
//! cached ranges to the interval still proven valid, deferring
//! re-evaluation to the next read.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use wasmindex_core::dependency::{Change, Dependency};
use wasmindex_core::error::{QueryError, StoreError};
use wasmindex_core::store::Storage;
use wasmindex_core::types::{canonicalize_args, Computation, NewComputation, OutputRun};

use crate::runtime::{block_env_at, FormulaRegistry};

/// Counters returned by an invalidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    pub updated: u64,
    pub destroyed: u64,
}

/// Read-through cache over a [`Storage`] and a [`FormulaRegistry`].
pub struct ComputationCache {
    storage: Arc<dyn Storage>,
    registry: Arc<FormulaRegistry>,
    chain_id: String,
}

impl ComputationCache {
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<FormulaRegistry>, chain_id: impl Into<String>) -> Self {
        Self {
            storage,
            registry,
            chain_id: chain_id.into(),
        }
    }

    pub fn registry(&self) -> &FormulaRegistry {
        &self.registry
    }

    /// Cached output of `formula(contract, args)` at block `at`, evaluating
    /// and storing on a miss. Fails with `NotYetIndexed` past the indexed
    /// head.
    pub async fn query(
        &self,
        formula: &str,
        contract: &str,
        args: &BTreeMap<String, String>,
        at: u64,
    ) -> Result<Computation, QueryError> {
        let canonical = canonicalize_args(args);

        if let Some(hit) = self
            .storage
            .find_valid_at(formula, contract, &canonical, at)
            .await?
        {
            return Ok(hit);
        }

        let state = self.storage.state().await?;
        if at > state.latest_block_height {
            return Err(QueryError::NotYetIndexed {
                requested: at,
                latest: state.latest_block_height,
            });
        }

        let block = block_env_at(self.storage.as_ref(), &self.chain_id, at).await?;
        let eval = self
            .registry
            .evaluate(self.storage.as_ref(), block, formula, contract, args)
            .await?;
        let deps = eval.dependencies.collapsed();

        // The output has been valid since the last change any dependency
        // saw at or before `at`.
        let heights = self.storage.event_heights_matching(&deps, 0, at).await?;
        let valid_from = heights.last().copied().unwrap_or(at);

        // A predecessor row whose coverage stops short of `valid_from` can
        // be widened up to the change boundary when no relevant event lies
        // between.
        if valid_from > 0 {
            if let Some(prev) = self
                .storage
                .latest_computation_before(formula, contract, &canonical, valid_from)
                .await?
            {
                if prev.block_height_latest < valid_from - 1 {
                    let between = self
                        .storage
                        .event_heights_matching(
                            &deps,
                            prev.block_height_latest + 1,
                            valid_from - 1,
                        )
                        .await?;
                    if between.is_empty() {
                        self.storage
                            .extend_latest(prev.id, valid_from - 1)
                            .await?;
                    }
                }
            }
        }

        let run = OutputRun {
            block_valid: valid_from,
            block_latest: at,
            output: eval.output,
        };
        Ok(self.store_run(formula, contract, &canonical, &run, &deps).await?)
    }

    /// Evaluate a formula over `[from, to]` and persist the resulting runs.
    pub async fn compute_contract_range(
        &self,
        formula: &str,
        contract: &str,
        args: &BTreeMap<String, String>,
        from: u64,
        to: u64,
    ) -> Result<Vec<Computation>, QueryError> {
        let (runs, deps) = self
            .registry
            .compute_range(
                self.storage.as_ref(),
                &self.chain_id,
                formula,
                contract,
                args,
                from,
                to,
            )
            .await?;
        let canonical = canonicalize_args(args);
        Ok(self
            .store_outputs(formula, contract, &canonical, &runs, &deps.collapsed())
            .await?)
    }

    /// Persist a set of output runs, keeping ranges disjoint and extending
    /// a rightward-adjacent equal output instead of inserting.
    pub async fn store_outputs(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        runs: &[OutputRun],
        deps: &[Dependency],
    ) -> Result<Vec<Computation>, StoreError> {
        let mut out = Vec::with_capacity(runs.len());
        for run in runs {
            out.push(self.store_run(formula, contract, args, run, deps).await?);
        }
        Ok(out)
    }

    async fn store_run(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        run: &OutputRun,
        deps: &[Dependency],
    ) -> Result<Computation, StoreError> {
        if run.block_valid > 0 {
            if let Some(adjacent) = self
                .storage
                .ending_at(formula, contract, args, run.block_valid - 1)
                .await?
            {
                if adjacent.output == run.output {
                    self.storage
                        .extend_latest(adjacent.id, run.block_latest)
                        .await?;
                    self.storage.replace_dependencies(adjacent.id, deps).await?;
                    return Ok(Computation {
                        block_height_latest: run.block_latest,
                        ..adjacent
                    });
                }
            }
        }

        self.storage
            .insert_computation(
                NewComputation {
                    formula: formula.to_string(),
                    target_contract: contract.to_string(),
                    args: args.to_string(),
                    block_height_valid: run.block_valid,
                    block_height_latest: run.block_latest,
                    output: run.output.clone(),
                },
                deps,
            )
            .await
    }

    /// Narrow or destroy cached computations whose dependency set
    /// intersects the flush's change-set.
    ///
    /// Per affected computation with `h_min` the lowest intersecting change
    /// height: above `latest` nothing happens, at or below `valid` the row
    /// is destroyed, otherwise `latest` becomes `h_min - 1`.
    pub async fn invalidate(&self, changes: &[Change]) -> Result<InvalidationStats, StoreError> {
        if changes.is_empty() {
            return Ok(InvalidationStats::default());
        }

        let mut stats = InvalidationStats::default();
        for dependent in self.storage.dependents_of(changes).await? {
            let computation = &dependent.computation;
            let h_min = changes
                .iter()
                .filter(|change| {
                    dependent
                        .dependencies
                        .iter()
                        .any(|dep| dep.matches(&change.contract_address, &change.key))
                })
                .map(|change| change.block_height)
                .min();
            let Some(h_min) = h_min else { continue };

            if h_min > computation.block_height_latest {
                continue;
            }
            if h_min <= computation.block_height_valid {
                self.storage.destroy_computation(computation.id).await?;
                stats.destroyed += 1;
            } else {
                self.storage
                    .truncate_latest(computation.id, h_min - 1)
                    .await?;
                stats.updated += 1;
            }
        }

        if stats.updated > 0 || stats.destroyed > 0 {
            debug!(
                updated = stats.updated,
                destroyed = stats.destroyed,
                "computation cache invalidated"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use wasmindex_core::error::FormulaError;
    use wasmindex_core::keys::key_to_comma;
    use wasmindex_core::store::{EventStore, StateStore};
    use wasmindex_core::types::WasmEvent;
    use wasmindex_storage::MemoryStorage;

    use crate::runtime::{Formula, FormulaEnv};

    struct GetX;

    #[async_trait]
    impl Formula for GetX {
        fn name(&self) -> &'static str {
            "get_x"
        }

        async fn compute(
            &self,
            env: &FormulaEnv<'_>,
            _args: &BTreeMap<String, String>,
        ) -> Result<serde_json::Value, FormulaError> {
            Ok(env
                .get_self(b"k1")
                .await?
                .and_then(|v| v.get("x").cloned())
                .unwrap_or(serde_json::Value::Null))
        }
    }

    struct Failing;

    #[async_trait]
    impl Formula for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn compute(
            &self,
            _env: &FormulaEnv<'_>,
            _args: &BTreeMap<String, String>,
        ) -> Result<serde_json::Value, FormulaError> {
            Err(FormulaError::Other("boom".into()))
        }
    }

    fn event(contract: &str, key: &[u8], height: u64, value: &str) -> WasmEvent {
        WasmEvent {
            block_height: height,
            block_time_unix_ms: height * 1000,
            contract_address: contract.into(),
            code_id: 1,
            key: key_to_comma(key),
            value: Some(value.into()),
            value_json: serde_json::from_str(value).ok(),
            deleted: false,
        }
    }

    async fn seed(storage: &MemoryStorage, events: &[WasmEvent]) {
        storage.upsert_contracts(events).await.unwrap();
        storage.upsert_events(events).await.unwrap();
        let max = events.iter().map(|e| e.block_height).max().unwrap_or(0);
        storage
            .advance_state(Some(max), Some((max, max * 1000)))
            .await
            .unwrap();
    }

    fn cache(storage: Arc<MemoryStorage>) -> ComputationCache {
        let mut registry = FormulaRegistry::new();
        registry.register(Arc::new(GetX));
        registry.register(Arc::new(Failing));
        ComputationCache::new(storage, Arc::new(registry), "test-1")
    }

    #[tokio::test]
    async fn miss_evaluates_and_stores() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, &[event("a", b"k1", 10, r#"{"x":1}"#)]).await;
        let cache = cache(storage.clone());

        let args = BTreeMap::new();
        let c = cache.query("get_x", "a", &args, 15).await.unwrap();
        assert_eq!(c.output, serde_json::json!(1));
        assert_eq!(c.block_height_valid, 10);
        assert_eq!(c.block_height_latest, 15);
        assert_eq!(storage.computation_count(), 1);

        // Second read at the same pin is a pure cache hit.
        let again = cache.query("get_x", "a", &args, 12).await.unwrap();
        assert_eq!(again.id, c.id);
    }

    #[tokio::test]
    async fn query_past_head_is_not_yet_indexed() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, &[event("a", b"k1", 10, r#"{"x":1}"#)]).await;
        let cache = cache(storage.clone());

        let err = cache.query("get_x", "a", &BTreeMap::new(), 99).await.unwrap_err();
        assert!(matches!(err, QueryError::NotYetIndexed { requested: 99, latest: 10 }));
    }

    #[tokio::test]
    async fn formula_failure_caches_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, &[event("a", b"k1", 10, r#"{"x":1}"#)]).await;
        let cache = cache(storage.clone());

        let err = cache.query("failing", "a", &BTreeMap::new(), 10).await.unwrap_err();
        assert!(matches!(err, QueryError::Formula(_)));
        assert_eq!(storage.computation_count(), 0);
    }

    #[tokio::test]
    async fn invalidation_truncates_and_new_read_inserts_disjoint_row() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, &[event("a", b"k1", 10, r#"{"x":1}"#)]).await;
        let cache = cache(storage.clone());
        let args = BTreeMap::new();

        let first = cache.query("get_x", "a", &args, 15).await.unwrap();
        assert_eq!((first.block_height_valid, first.block_height_latest), (10, 15));

        // New write at block 20 arrives; the chain has advanced to 25.
        let update = event("a", b"k1", 20, r#"{"x":2}"#);
        seed(&storage, &[update.clone()]).await;
        storage.advance_state(Some(25), Some((25, 25_000))).await.unwrap();
        let stats = cache.invalidate(&[Change::from_event(&update)]).await.unwrap();
        // Change is above the cached latest: coverage still valid as asserted.
        assert_eq!(stats, InvalidationStats { updated: 0, destroyed: 0 });

        // Value before the change is still served from cache.
        let old = cache.query("get_x", "a", &args, 15).await.unwrap();
        assert_eq!(old.output, serde_json::json!(1));

        // Reading past the change lazily inserts the new coverage and
        // widens the old row up to the boundary.
        let new = cache.query("get_x", "a", &args, 25).await.unwrap();
        assert_eq!(new.output, serde_json::json!(2));
        assert_eq!((new.block_height_valid, new.block_height_latest), (20, 25));

        let rows = storage.computations_for("get_x", "a", &canonicalize_args(&args));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].block_height_latest, 19);
        assert_eq!(rows[1].block_height_valid, 20);
    }

    #[tokio::test]
    async fn invalidation_truncates_mid_range() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, &[event("a", b"k1", 10, r#"{"x":1}"#)]).await;
        storage.advance_state(Some(30), Some((30, 30_000))).await.unwrap();
        let cache = cache(storage.clone());
        let args = BTreeMap::new();

        let first = cache.query("get_x", "a", &args, 30).await.unwrap();
        assert_eq!((first.block_height_valid, first.block_height_latest), (10, 30));

        let update = event("a", b"k1", 20, r#"{"x":2}"#);
        seed(&storage, &[update.clone()]).await;
        let stats = cache.invalidate(&[Change::from_event(&update)]).await.unwrap();
        assert_eq!(stats, InvalidationStats { updated: 1, destroyed: 0 });

        let rows = storage.computations_for("get_x", "a", &canonicalize_args(&args));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].block_height_latest, 19);
    }

    #[tokio::test]
    async fn invalidation_destroys_when_change_predates_validity() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, &[event("a", b"k1", 10, r#"{"x":1}"#)]).await;
        let cache = cache(storage.clone());
        let args = BTreeMap::new();

        cache.query("get_x", "a", &args, 15).await.unwrap();

        // A backfilled write at or below the validity start invalidates the
        // whole assertion.
        let update = event("a", b"k1", 10, r#"{"x":9}"#);
        seed(&storage, &[update.clone()]).await;
        let stats = cache.invalidate(&[Change::from_event(&update)]).await.unwrap();
        assert_eq!(stats, InvalidationStats { updated: 0, destroyed: 1 });
        assert_eq!(storage.computation_count(), 0);
    }

    #[tokio::test]
    async fn prefix_dependencies_intersect_changed_keys() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, &[event("a", b"k1", 10, r#"{"x":1}"#)]).await;
        let cache = cache(storage.clone());

        // Hand-store a computation that depends on a key prefix.
        cache
            .store_outputs(
                "get_x",
                "a",
                "{}",
                &[OutputRun {
                    block_valid: 5,
                    block_latest: 30,
                    output: serde_json::json!(1),
                }],
                &[Dependency::prefix("a", key_to_comma(b"k"))],
            )
            .await
            .unwrap();

        // A write to a key under the prefix truncates it…
        let change = Change {
            contract_address: "a".into(),
            key: format!("{},{}", key_to_comma(b"k"), 49),
            block_height: 20,
        };
        let stats = cache.invalidate(&[change]).await.unwrap();
        assert_eq!(stats.updated, 1);

        // …while an unrelated key does nothing.
        let unrelated = Change {
            contract_address: "a".into(),
            key: key_to_comma(b"zz"),
            block_height: 6,
        };
        let stats = cache.invalidate(&[unrelated]).await.unwrap();
        assert_eq!(stats, InvalidationStats::default());
    }

    #[tokio::test]
    async fn range_runs_extend_adjacent_equal_output() {
        let storage = Arc::new(MemoryStorage::new());
        seed(
            &storage,
            &[
                event("a", b"k1", 10, r#"{"x":1}"#),
                event("a", b"k1", 20, r#"{"x":2}"#),
            ],
        )
        .await;
        let cache = cache(storage.clone());
        let args = BTreeMap::new();
        let canonical = canonicalize_args(&args);

        let rows = cache
            .compute_contract_range("get_x", "a", &args, 10, 25)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        // Re-running over an adjacent later range with the same tail output
        // extends the second row instead of inserting a third.
        let rows = cache
            .compute_contract_range("get_x", "a", &args, 26, 30)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].block_height_valid, 20);
        assert_eq!(rows[0].block_height_latest, 30);

        let stored = storage.computations_for("get_x", "a", &canonical);
        assert_eq!(stored.len(), 2);
    }
}
