//! In-memory storage backend.
//!
//! Keeps every table in RAM behind mutexes. Useful for tests and for
//! short-lived indexers that don't need persistence; all data is lost when
//! the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use wasmindex_core::dependency::{Change, Dependency};
use wasmindex_core::error::StoreError;
use wasmindex_core::store::{
    ComputationStore, ComputationWithDeps, EventStore, StateStore, TransformationStore,
    WebhookQueue,
};
use wasmindex_core::types::{
    Computation, Contract, NewComputation, NewPendingWebhook, PendingWebhook, State,
    StoredWasmEvent, Transformation, WasmEvent,
};

/// In-memory implementation of the full [`wasmindex_core::store::Storage`]
/// surface.
#[derive(Default)]
pub struct MemoryStorage {
    contracts: Mutex<HashMap<String, Contract>>,
    /// (contract, key, height) → event. BTreeMap keeps per-key history
    /// ordered for the "latest at or before" scans.
    events: Mutex<BTreeMap<(String, String, u64), WasmEvent>>,
    transformations: Mutex<BTreeMap<(String, String, u64), Transformation>>,
    computations: Mutex<HashMap<i64, (Computation, Vec<Dependency>)>>,
    next_computation_id: Mutex<i64>,
    state: Mutex<Option<State>>,
    webhooks: Mutex<BTreeMap<i64, PendingWebhook>>,
    next_webhook_id: Mutex<i64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored event rows (test helper).
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Total number of computation rows (test helper).
    pub fn computation_count(&self) -> usize {
        self.computations.lock().unwrap().len()
    }

    /// All computation rows for an identity, ordered by `block_height_valid`
    /// (test helper).
    pub fn computations_for(&self, formula: &str, contract: &str, args: &str) -> Vec<Computation> {
        let mut rows: Vec<Computation> = self
            .computations
            .lock()
            .unwrap()
            .values()
            .filter(|(c, _)| {
                c.formula == formula && c.target_contract == contract && c.args == args
            })
            .map(|(c, _)| c.clone())
            .collect();
        rows.sort_by_key(|c| c.block_height_valid);
        rows
    }
}

#[async_trait]
impl EventStore for MemoryStorage {
    async fn upsert_contracts(&self, batch: &[WasmEvent]) -> Result<Vec<Contract>, StoreError> {
        let mut contracts = self.contracts.lock().unwrap();
        let mut seen: Vec<String> = Vec::new();

        for event in batch {
            if !seen.contains(&event.contract_address) {
                seen.push(event.contract_address.clone());
            }
            contracts
                .entry(event.contract_address.clone())
                .and_modify(|c| c.code_id = event.code_id)
                .or_insert_with(|| Contract {
                    address: event.contract_address.clone(),
                    code_id: event.code_id,
                    instantiated_at_height: event.block_height,
                    instantiated_at_time_unix_ms: event.block_time_unix_ms,
                });
        }

        Ok(seen
            .iter()
            .filter_map(|addr| contracts.get(addr).cloned())
            .collect())
    }

    async fn upsert_events(
        &self,
        batch: &[WasmEvent],
    ) -> Result<Vec<StoredWasmEvent>, StoreError> {
        let contracts = self.contracts.lock().unwrap();
        let mut events = self.events.lock().unwrap();
        let mut out = Vec::with_capacity(batch.len());

        for event in batch {
            events.insert(
                (
                    event.contract_address.clone(),
                    event.key.clone(),
                    event.block_height,
                ),
                event.clone(),
            );
            let contract = contracts
                .get(&event.contract_address)
                .cloned()
                .ok_or_else(|| {
                    StoreError::NotFound(format!("contract {}", event.contract_address))
                })?;
            out.push(StoredWasmEvent {
                event: event.clone(),
                contract,
            });
        }
        Ok(out)
    }

    async fn latest_event_at(
        &self,
        contract: &str,
        key: &str,
        at: u64,
    ) -> Result<Option<WasmEvent>, StoreError> {
        let events = self.events.lock().unwrap();
        let lo = (contract.to_string(), key.to_string(), 0u64);
        let hi = (contract.to_string(), key.to_string(), at);
        Ok(events.range(lo..=hi).next_back().map(|(_, e)| e.clone()))
    }

    async fn map_at(
        &self,
        contract: &str,
        prefix: &str,
        at: u64,
    ) -> Result<Vec<WasmEvent>, StoreError> {
        let events = self.events.lock().unwrap();
        // Latest row per key under the prefix, tombstones dropped.
        let mut latest: BTreeMap<String, WasmEvent> = BTreeMap::new();
        for ((c, key, height), event) in events.iter() {
            if c.as_str() != contract || *height > at {
                continue;
            }
            if !wasmindex_core::keys::key_matches_prefix(key, prefix) {
                continue;
            }
            latest.insert(key.clone(), event.clone());
        }
        Ok(latest.into_values().filter(|e| !e.deleted).collect())
    }

    async fn first_set(
        &self,
        contract: &str,
        key: &str,
    ) -> Result<Option<WasmEvent>, StoreError> {
        let events = self.events.lock().unwrap();
        let lo = (contract.to_string(), key.to_string(), 0u64);
        let hi = (contract.to_string(), key.to_string(), u64::MAX);
        Ok(events
            .range(lo..=hi)
            .map(|(_, e)| e)
            .find(|e| !e.deleted)
            .cloned())
    }

    async fn previous_event(
        &self,
        contract: &str,
        key: &str,
        before: u64,
    ) -> Result<Option<WasmEvent>, StoreError> {
        if before == 0 {
            return Ok(None);
        }
        self.latest_event_at(contract, key, before - 1).await
    }

    async fn event_heights_matching(
        &self,
        deps: &[Dependency],
        from: u64,
        to: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let events = self.events.lock().unwrap();
        let mut heights: Vec<u64> = events
            .iter()
            .filter(|((contract, key, height), _)| {
                *height >= from
                    && *height <= to
                    && deps.iter().any(|d| d.matches(contract, key))
            })
            .map(|((_, _, height), _)| *height)
            .collect();
        heights.sort_unstable();
        heights.dedup();
        Ok(heights)
    }

    async fn latest_block_time_at(&self, at: u64) -> Result<Option<u64>, StoreError> {
        let events = self.events.lock().unwrap();
        Ok(events
            .values()
            .filter(|e| e.block_height <= at)
            .max_by_key(|e| e.block_height)
            .map(|e| e.block_time_unix_ms))
    }

    async fn contract(&self, address: &str) -> Result<Option<Contract>, StoreError> {
        Ok(self.contracts.lock().unwrap().get(address).cloned())
    }

    async fn contract_has_events(&self, address: &str) -> Result<bool, StoreError> {
        let events = self.events.lock().unwrap();
        Ok(events.iter().any(|((c, _, _), _)| c.as_str() == address))
    }
}

#[async_trait]
impl TransformationStore for MemoryStorage {
    async fn upsert_transformations(
        &self,
        rows: &[Transformation],
    ) -> Result<Vec<Transformation>, StoreError> {
        let mut transformations = self.transformations.lock().unwrap();
        for row in rows {
            transformations.insert(
                (
                    row.contract_address.clone(),
                    row.name.clone(),
                    row.block_height,
                ),
                row.clone(),
            );
        }
        Ok(rows.to_vec())
    }

    async fn latest_transformation_at(
        &self,
        contract: &str,
        name: &str,
        at: u64,
    ) -> Result<Option<Transformation>, StoreError> {
        let transformations = self.transformations.lock().unwrap();
        let lo = (contract.to_string(), name.to_string(), 0u64);
        let hi = (contract.to_string(), name.to_string(), at);
        Ok(transformations
            .range(lo..=hi)
            .next_back()
            .map(|(_, t)| t.clone()))
    }
}

#[async_trait]
impl ComputationStore for MemoryStorage {
    async fn find_valid_at(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        at: u64,
    ) -> Result<Option<Computation>, StoreError> {
        Ok(self
            .computations
            .lock()
            .unwrap()
            .values()
            .map(|(c, _)| c)
            .find(|c| {
                c.formula == formula
                    && c.target_contract == contract
                    && c.args == args
                    && c.block_height_valid <= at
                    && at <= c.block_height_latest
            })
            .cloned())
    }

    async fn ending_at(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        height: u64,
    ) -> Result<Option<Computation>, StoreError> {
        Ok(self
            .computations
            .lock()
            .unwrap()
            .values()
            .map(|(c, _)| c)
            .find(|c| {
                c.formula == formula
                    && c.target_contract == contract
                    && c.args == args
                    && c.block_height_latest == height
            })
            .cloned())
    }

    async fn latest_computation_before(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        height: u64,
    ) -> Result<Option<Computation>, StoreError> {
        Ok(self
            .computations
            .lock()
            .unwrap()
            .values()
            .map(|(c, _)| c)
            .filter(|c| {
                c.formula == formula
                    && c.target_contract == contract
                    && c.args == args
                    && c.block_height_latest < height
            })
            .max_by_key(|c| c.block_height_latest)
            .cloned())
    }

    async fn insert_computation(
        &self,
        computation: NewComputation,
        deps: &[Dependency],
    ) -> Result<Computation, StoreError> {
        let mut next_id = self.next_computation_id.lock().unwrap();
        *next_id += 1;
        let row = Computation {
            id: *next_id,
            formula: computation.formula,
            target_contract: computation.target_contract,
            args: computation.args,
            block_height_valid: computation.block_height_valid,
            block_height_latest: computation.block_height_latest,
            output: computation.output,
        };
        self.computations
            .lock()
            .unwrap()
            .insert(row.id, (row.clone(), deps.to_vec()));
        Ok(row)
    }

    async fn extend_latest(&self, id: i64, new_latest: u64) -> Result<(), StoreError> {
        let mut computations = self.computations.lock().unwrap();
        let (c, _) = computations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("computation {id}")))?;
        c.block_height_latest = new_latest;
        Ok(())
    }

    async fn replace_dependencies(&self, id: i64, deps: &[Dependency]) -> Result<(), StoreError> {
        let mut computations = self.computations.lock().unwrap();
        let (_, stored) = computations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("computation {id}")))?;
        *stored = deps.to_vec();
        Ok(())
    }

    async fn truncate_latest(&self, id: i64, new_latest: u64) -> Result<(), StoreError> {
        self.extend_latest(id, new_latest).await
    }

    async fn destroy_computation(&self, id: i64) -> Result<(), StoreError> {
        self.computations.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn dependents_of(
        &self,
        changes: &[Change],
    ) -> Result<Vec<ComputationWithDeps>, StoreError> {
        Ok(self
            .computations
            .lock()
            .unwrap()
            .values()
            .filter(|(_, deps)| {
                deps.iter().any(|dep| {
                    changes
                        .iter()
                        .any(|ch| dep.matches(&ch.contract_address, &ch.key))
                })
            })
            .map(|(c, deps)| ComputationWithDeps {
                computation: c.clone(),
                dependencies: deps.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl StateStore for MemoryStorage {
    async fn state(&self) -> Result<State, StoreError> {
        Ok(self.state.lock().unwrap().unwrap_or_default())
    }

    async fn advance_state(
        &self,
        last_exported: Option<u64>,
        latest: Option<(u64, u64)>,
    ) -> Result<State, StoreError> {
        let mut guard = self.state.lock().unwrap();
        let mut state = guard.unwrap_or_default();
        if let Some(exported) = last_exported {
            state.last_wasm_block_height_exported =
                state.last_wasm_block_height_exported.max(exported);
        }
        if let Some((height, time_ms)) = latest {
            state.latest_block_height = state.latest_block_height.max(height);
            state.latest_block_time_unix_ms = state.latest_block_time_unix_ms.max(time_ms);
        }
        *guard = Some(state);
        Ok(state)
    }
}

#[async_trait]
impl WebhookQueue for MemoryStorage {
    async fn enqueue_webhooks(&self, rows: &[NewPendingWebhook]) -> Result<u64, StoreError> {
        let mut next_id = self.next_webhook_id.lock().unwrap();
        let mut webhooks = self.webhooks.lock().unwrap();
        for row in rows {
            *next_id += 1;
            webhooks.insert(
                *next_id,
                PendingWebhook {
                    id: *next_id,
                    block_height: row.block_height,
                    contract_address: row.contract_address.clone(),
                    key: row.key.clone(),
                    endpoint: row.endpoint.clone(),
                    value: row.value.clone(),
                    failures: 0,
                },
            );
        }
        Ok(rows.len() as u64)
    }

    async fn pending_webhooks(&self, limit: i64) -> Result<Vec<PendingWebhook>, StoreError> {
        Ok(self
            .webhooks
            .lock()
            .unwrap()
            .values()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn delete_webhook(&self, id: i64) -> Result<(), StoreError> {
        self.webhooks.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn record_webhook_failure(&self, id: i64) -> Result<u32, StoreError> {
        let mut webhooks = self.webhooks.lock().unwrap();
        let row = webhooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("pending webhook {id}")))?;
        row.failures += 1;
        Ok(row.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(contract: &str, key: &str, height: u64, value: &str) -> WasmEvent {
        WasmEvent {
            block_height: height,
            block_time_unix_ms: height * 1000,
            contract_address: contract.into(),
            code_id: 1,
            key: key.into(),
            value: Some(value.into()),
            value_json: serde_json::from_str(value).ok(),
            deleted: false,
        }
    }

    fn tombstone(contract: &str, key: &str, height: u64) -> WasmEvent {
        WasmEvent {
            block_height: height,
            block_time_unix_ms: height * 1000,
            contract_address: contract.into(),
            code_id: 1,
            key: key.into(),
            value: None,
            value_json: None,
            deleted: true,
        }
    }

    #[tokio::test]
    async fn contract_upsert_is_write_once_for_instantiation() {
        let store = MemoryStorage::new();
        let first = event("c1", "1", 10, "\"a\"");
        store.upsert_contracts(&[first.clone()]).await.unwrap();

        let mut later = event("c1", "1", 20, "\"b\"");
        later.code_id = 2;
        let contracts = store.upsert_contracts(&[later]).await.unwrap();

        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].code_id, 2);
        assert_eq!(contracts[0].instantiated_at_height, 10);
    }

    #[tokio::test]
    async fn event_upsert_replaces_on_conflict() {
        let store = MemoryStorage::new();
        store.upsert_contracts(&[event("c1", "1", 10, "\"a\"")]).await.unwrap();
        store.upsert_events(&[event("c1", "1", 10, "\"a\"")]).await.unwrap();
        store.upsert_events(&[event("c1", "1", 10, "\"b\"")]).await.unwrap();

        assert_eq!(store.event_count(), 1);
        let row = store.latest_event_at("c1", "1", 10).await.unwrap().unwrap();
        assert_eq!(row.value.as_deref(), Some("\"b\""));
    }

    #[tokio::test]
    async fn latest_event_respects_block_pin() {
        let store = MemoryStorage::new();
        let batch = vec![event("c1", "1", 10, "1"), event("c1", "1", 20, "2")];
        store.upsert_contracts(&batch).await.unwrap();
        store.upsert_events(&batch).await.unwrap();

        let at15 = store.latest_event_at("c1", "1", 15).await.unwrap().unwrap();
        assert_eq!(at15.block_height, 10);
        let at25 = store.latest_event_at("c1", "1", 25).await.unwrap().unwrap();
        assert_eq!(at25.block_height, 20);
        assert!(store.latest_event_at("c1", "1", 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn map_at_drops_tombstones() {
        let store = MemoryStorage::new();
        let batch = vec![
            event("c1", "0,7,97", 10, "1"),
            event("c1", "0,7,98", 10, "2"),
            tombstone("c1", "0,7,97", 15),
        ];
        store.upsert_contracts(&batch).await.unwrap();
        store.upsert_events(&batch).await.unwrap();

        let at12 = store.map_at("c1", "0,7", 12).await.unwrap();
        assert_eq!(at12.len(), 2);
        let at20 = store.map_at("c1", "0,7", 20).await.unwrap();
        assert_eq!(at20.len(), 1);
        assert_eq!(at20[0].key, "0,7,98");
    }

    #[tokio::test]
    async fn state_advance_is_monotonic() {
        let store = MemoryStorage::new();
        store.advance_state(Some(10), Some((10, 1000))).await.unwrap();
        let state = store.advance_state(Some(5), Some((5, 500))).await.unwrap();
        assert_eq!(state.last_wasm_block_height_exported, 10);
        assert_eq!(state.latest_block_height, 10);
        assert_eq!(state.latest_block_time_unix_ms, 1000);
    }

    #[tokio::test]
    async fn webhook_queue_lifecycle() {
        let store = MemoryStorage::new();
        store
            .enqueue_webhooks(&[NewPendingWebhook {
                block_height: 1,
                contract_address: "c1".into(),
                key: "1".into(),
                endpoint: wasmindex_core::types::Endpoint::Soketi {
                    channel: "ch".into(),
                    event: "ev".into(),
                },
                value: serde_json::json!({"x": 1}),
            }])
            .await
            .unwrap();

        let pending = store.pending_webhooks(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].failures, 0);

        let failures = store.record_webhook_failure(pending[0].id).await.unwrap();
        assert_eq!(failures, 1);

        store.delete_webhook(pending[0].id).await.unwrap();
        assert!(store.pending_webhooks(10).await.unwrap().is_empty());
    }
}
