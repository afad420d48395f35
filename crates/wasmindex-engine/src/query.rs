//! Query entry point consumed by the external HTTP layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use wasmindex_core::error::QueryError;
use wasmindex_core::store::Storage;

use crate::cache::ComputationCache;

/// Computes formula outputs on demand, backed by the computation cache.
pub struct QueryEngine {
    storage: Arc<dyn Storage>,
    cache: Arc<ComputationCache>,
}

impl QueryEngine {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<ComputationCache>) -> Self {
        Self { storage, cache }
    }

    /// `compute(formula, contract, args, at?)` — `at` defaults to the
    /// latest indexed block.
    pub async fn compute(
        &self,
        formula: &str,
        contract: &str,
        args: &BTreeMap<String, String>,
        at: Option<u64>,
    ) -> Result<serde_json::Value, QueryError> {
        if !self.cache.registry().contains(formula) {
            return Err(QueryError::UnknownFormula(formula.to_string()));
        }
        if self.storage.contract(contract).await?.is_none() {
            return Err(QueryError::ContractNotFound(contract.to_string()));
        }
        if !self.storage.contract_has_events(contract).await? {
            return Err(QueryError::NoEvents(contract.to_string()));
        }

        let at = match at {
            Some(height) => height,
            None => self.storage.state().await?.latest_block_height,
        };

        let computation = self.cache.query(formula, contract, args, at).await?;
        Ok(computation.output)
    }
}
