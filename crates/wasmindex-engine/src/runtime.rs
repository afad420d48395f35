//! Formula runtime — a read-through, block-scoped view over contract state.
//!
//! A formula is a deterministic async function of its environment plus its
//! args. The environment pins a concrete block: `get` returns the latest
//! event at or before that block, and every read records a value dependency
//! into a per-evaluation accumulator. Nested formula calls share the
//! accumulator, so dependencies transit call boundaries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use wasmindex_core::dependency::{Dependency, DependencySet};
use wasmindex_core::error::FormulaError;
use wasmindex_core::keys::{comma_to_key, key_to_comma};
use wasmindex_core::store::Storage;
use wasmindex_core::types::{BlockEnv, Contract, OutputRun};

/// The result of evaluating a formula at one block.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub output: serde_json::Value,
    pub dependencies: DependencySet,
}

/// Per-evaluation shared state: the dependency accumulator and a cache of
/// contracts already looked up.
#[derive(Default)]
struct EvalContext {
    deps: Mutex<DependencySet>,
    contracts: Mutex<HashMap<String, Option<Contract>>>,
}

/// The environment handed to a formula, pinned to one block and one target
/// contract.
pub struct FormulaEnv<'a> {
    storage: &'a dyn Storage,
    registry: &'a FormulaRegistry,
    ctx: &'a EvalContext,
    block: BlockEnv,
    contract_address: String,
}

impl<'a> FormulaEnv<'a> {
    /// The contract this formula targets.
    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    /// Block height, block time, and chain id of the pinned block.
    pub fn block_env(&self) -> &BlockEnv {
        &self.block
    }

    /// Read `(contract, key)` at the pinned block. Records a point
    /// dependency. Tombstones read as `None`; parsed JSON is preferred over
    /// the raw string value.
    pub async fn get(
        &self,
        contract: &str,
        key: &[u8],
    ) -> Result<Option<serde_json::Value>, FormulaError> {
        let comma = key_to_comma(key);
        self.record(Dependency::point(contract, comma.clone()));
        let event = self
            .storage
            .latest_event_at(contract, &comma, self.block.block_height)
            .await?;
        Ok(event.and_then(|e| e.read_value()))
    }

    /// Read the target contract's own `key`.
    pub async fn get_self(&self, key: &[u8]) -> Result<Option<serde_json::Value>, FormulaError> {
        self.get(&self.contract_address.clone(), key).await
    }

    /// Range read: the latest value per key under `prefix` at the pinned
    /// block, keyed by the remaining key bytes (UTF-8 when possible).
    /// Records a prefix dependency.
    pub async fn get_map(
        &self,
        contract: &str,
        prefix: &[u8],
    ) -> Result<BTreeMap<String, serde_json::Value>, FormulaError> {
        let comma = key_to_comma(prefix);
        self.record(Dependency::prefix(contract, comma.clone()));
        let events = self
            .storage
            .map_at(contract, &comma, self.block.block_height)
            .await?;

        let mut out = BTreeMap::new();
        for event in events {
            let bytes = comma_to_key(&event.key)
                .map_err(|e| FormulaError::Other(format!("stored key: {e}")))?;
            let rest = bytes[prefix.len().min(bytes.len())..].to_vec();
            let name = match String::from_utf8(rest) {
                Ok(s) => s,
                Err(e) => key_to_comma(e.as_bytes()),
            };
            if let Some(value) = event.read_value() {
                out.insert(name, value);
            }
        }
        Ok(out)
    }

    /// Timestamp of the first non-delete write to `(contract, key)`.
    /// Records a point dependency.
    pub async fn get_created_at(
        &self,
        contract: &str,
        key: &[u8],
    ) -> Result<Option<DateTime<Utc>>, FormulaError> {
        let comma = key_to_comma(key);
        self.record(Dependency::point(contract, comma.clone()));
        let event = self.storage.first_set(contract, &comma).await?;
        Ok(event.map(|e| {
            Utc.timestamp_millis_opt(e.block_time_unix_ms as i64)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH)
        }))
    }

    /// Look up a contract row, cached per evaluation.
    pub async fn contract(&self, address: &str) -> Result<Option<Contract>, FormulaError> {
        if let Some(cached) = self.ctx.contracts.lock().unwrap().get(address) {
            return Ok(cached.clone());
        }
        let contract = self.storage.contract(address).await?;
        self.ctx
            .contracts
            .lock()
            .unwrap()
            .insert(address.to_string(), contract.clone());
        Ok(contract)
    }

    /// Call another formula against `contract` within this evaluation.
    /// Dependencies it records accumulate into the same set.
    pub async fn formula(
        &self,
        name: &str,
        contract: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        let formula = self
            .registry
            .get(name)
            .ok_or_else(|| FormulaError::UnknownFormula(name.to_string()))?;
        let env = FormulaEnv {
            storage: self.storage,
            registry: self.registry,
            ctx: self.ctx,
            block: self.block.clone(),
            contract_address: contract.to_string(),
        };
        formula.compute(&env, args).await
    }

    fn record(&self, dep: Dependency) {
        self.ctx.deps.lock().unwrap().record(dep);
    }
}

/// A named, deterministic, dependency-tracked computation over contract
/// state at a pinned block.
#[async_trait]
pub trait Formula: Send + Sync {
    fn name(&self) -> &'static str;

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError>;
}

/// Maps formula names to implementations.
#[derive(Default)]
pub struct FormulaRegistry {
    formulas: HashMap<&'static str, std::sync::Arc<dyn Formula>>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock formulas.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for formula in crate::formulas::defaults() {
            registry.register(formula);
        }
        registry
    }

    pub fn register(&mut self, formula: std::sync::Arc<dyn Formula>) {
        self.formulas.insert(formula.name(), formula);
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Formula>> {
        self.formulas.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.formulas.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Evaluate `name` against `contract` at the given block, returning the
    /// output together with the recorded dependency set.
    pub async fn evaluate(
        &self,
        storage: &dyn Storage,
        block: BlockEnv,
        name: &str,
        contract: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<Evaluation, FormulaError> {
        let formula = self
            .get(name)
            .ok_or_else(|| FormulaError::UnknownFormula(name.to_string()))?;

        let ctx = EvalContext::default();
        let env = FormulaEnv {
            storage,
            registry: self,
            ctx: &ctx,
            block,
            contract_address: contract.to_string(),
        };
        let output = formula.compute(&env, args).await?;
        drop(env);

        let dependencies = ctx.deps.into_inner().unwrap_or_default();
        Ok(Evaluation {
            output,
            dependencies,
        })
    }

    /// Evaluate at every block in `[from, to]` where an event relevant to
    /// the formula landed, coalescing adjacent equal outputs into runs.
    pub async fn compute_range(
        &self,
        storage: &dyn Storage,
        chain_id: &str,
        name: &str,
        contract: &str,
        args: &BTreeMap<String, String>,
        from: u64,
        to: u64,
    ) -> Result<(Vec<OutputRun>, DependencySet), FormulaError> {
        let first = self
            .evaluate(storage, block_env_at(storage, chain_id, from).await?, name, contract, args)
            .await?;

        let mut all_deps = DependencySet::new();
        all_deps.extend(first.dependencies.clone());

        let heights = storage
            .event_heights_matching(&first.dependencies.collapsed(), from + 1, to)
            .await?;

        let mut runs = vec![OutputRun {
            block_valid: from,
            block_latest: to,
            output: first.output,
        }];

        for height in heights {
            let eval = self
                .evaluate(
                    storage,
                    block_env_at(storage, chain_id, height).await?,
                    name,
                    contract,
                    args,
                )
                .await?;
            all_deps.extend(eval.dependencies);

            if let Some(last) = runs.last_mut() {
                if eval.output == last.output {
                    continue;
                }
                last.block_latest = height - 1;
            }
            runs.push(OutputRun {
                block_valid: height,
                block_latest: to,
                output: eval.output,
            });
        }

        Ok((runs, all_deps))
    }
}

/// Pin a [`BlockEnv`] to a height, deriving the block time from the latest
/// indexed event at or before it.
pub async fn block_env_at(
    storage: &dyn Storage,
    chain_id: &str,
    height: u64,
) -> Result<BlockEnv, FormulaError> {
    let time = storage.latest_block_time_at(height).await?.unwrap_or(0);
    Ok(BlockEnv {
        block_height: height,
        block_time_unix_ms: time,
        chain_id: chain_id.to_string(),
    })
}
