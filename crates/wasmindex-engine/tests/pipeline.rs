//! End-to-end pipeline tests over the in-memory backend: stream lines in,
//! query formulas out.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::watch;

use wasmindex_core::config::{
    IndexerConfig, WebhookConfig, WebhookEndpointConfig, WebhookValueMode,
};
use wasmindex_core::error::{FormulaError, QueryError};
use wasmindex_core::store::{EventStore, StateStore, TransformationStore, WebhookQueue};
use wasmindex_core::transform::TransformerRegistry;
use wasmindex_engine::{
    ComputationCache, Formula, FormulaEnv, FormulaRegistry, IngestDriver, QueryEngine,
    RecordingSearchIndexer,
};
use wasmindex_storage::MemoryStorage;
use wasmindex_webhooks::{subscriptions_from_config, WebhookDispatcher};

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
        Err(FormulaError::Other("deliberate".into()))
    }
}

fn registry() -> Arc<FormulaRegistry> {
    let mut registry = FormulaRegistry::with_defaults();
    registry.register(Arc::new(GetX));
    registry.register(Arc::new(Failing));
    Arc::new(registry)
}

fn config(batch: usize) -> IndexerConfig {
    serde_json::from_value(serde_json::json!({
        "db": { "url": "postgresql://unused" },
        "batch": batch,
    }))
    .unwrap()
}

struct Harness {
    storage: Arc<MemoryStorage>,
    search: Arc<RecordingSearchIndexer>,
    driver: IngestDriver,
    query: QueryEngine,
}

fn harness(config: &IndexerConfig, webhooks: &[WebhookConfig]) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let search = Arc::new(RecordingSearchIndexer::new());
    let registry = registry();

    let dispatcher = if webhooks.is_empty() {
        None
    } else {
        Some(WebhookDispatcher::new(
            storage.clone(),
            subscriptions_from_config(webhooks, None),
        ))
    };

    let driver = IngestDriver::new(
        storage.clone(),
        TransformerRegistry::with_default_rules(),
        ComputationCache::new(storage.clone(), registry.clone(), "test-1"),
        dispatcher,
        search.clone(),
        config,
    );
    let query = QueryEngine::new(
        storage.clone(),
        Arc::new(ComputationCache::new(storage.clone(), registry, "test-1")),
    );

    Harness {
        storage,
        search,
        driver,
        query,
    }
}

fn line(height: u64, contract: &str, key: &str, value: &str, delete: bool) -> String {
    serde_json::json!({
        "blockHeight": height,
        "blockTimeUnixMs": height * 1000,
        "contractAddress": contract,
        "codeId": 1,
        "key": BASE64.encode(key.as_bytes()),
        "value": BASE64.encode(value.as_bytes()),
        "delete": delete,
    })
    .to_string()
}

async fn run(driver: &mut IngestDriver, lines: &[String]) -> wasmindex_engine::IngestStats {
    let data = lines.join("\n");
    let (_tx, rx) = watch::channel(false);
    driver.run(data.as_bytes(), rx).await.unwrap()
}

#[tokio::test]
async fn scenario_point_read_truncation_and_new_range() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    // Block 10: k1 = {"x":1}.
    run(&mut h.driver, &[line(10, "A", "k1", r#"{"x":1}"#, false)]).await;
    h.storage.advance_state(None, Some((15, 15_000))).await.unwrap();

    let args = BTreeMap::new();
    let at15 = h.query.compute("get_x", "A", &args, Some(15)).await.unwrap();
    assert_eq!(at15, serde_json::json!(1));

    // Block 20: k1 = {"x":2} arrives through the same pipeline.
    run(&mut h.driver, &[line(20, "A", "k1", r#"{"x":2}"#, false)]).await;
    h.storage.advance_state(None, Some((25, 25_000))).await.unwrap();

    // History is preserved…
    let at15 = h.query.compute("get_x", "A", &args, Some(15)).await.unwrap();
    assert_eq!(at15, serde_json::json!(1));
    // …and the new value is served past the change.
    let at25 = h.query.compute("get_x", "A", &args, Some(25)).await.unwrap();
    assert_eq!(at25, serde_json::json!(2));

    // Two disjoint cached ranges: [..,19] and [20,25].
    let rows = h.storage.computations_for("get_x", "A", "{}");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].block_height_latest, 19);
    assert_eq!(rows[1].block_height_valid, 20);
    assert_eq!(rows[1].block_height_latest, 25);
    assert_eq!(rows[1].output, serde_json::json!(2));
}

#[tokio::test]
async fn scenario_duplicate_in_batch_keeps_last() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    run(
        &mut h.driver,
        &[
            line(10, "A", "k1", r#"{"x":1}"#, false),
            line(10, "A", "k1", r#"{"x":2}"#, false),
        ],
    )
    .await;

    assert_eq!(h.storage.event_count(), 1);
    let row = h
        .storage
        .latest_event_at("A", &wasmindex_core::keys::key_to_comma(b"k1"), 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.value_json, Some(serde_json::json!({"x": 2})));
}

#[tokio::test]
async fn scenario_webhook_enqueued_with_previous_value() {
    let cfg = config(5000);
    let webhooks = vec![WebhookConfig {
        contract_addresses: vec![],
        code_ids: vec![],
        key_prefix: Some("balance:".into()),
        value: WebhookValueMode::Change,
        endpoint: WebhookEndpointConfig::Url {
            url: "https://example.com/hook".into(),
            method: "POST".into(),
            headers: BTreeMap::new(),
        },
    }];
    let mut h = harness(&cfg, &webhooks);

    run(&mut h.driver, &[line(90, "A", "balance:X", "\"10\"", false)]).await;
    run(&mut h.driver, &[line(100, "A", "balance:X", "\"20\"", false)]).await;

    let pending = h.storage.pending_webhooks(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    let last = &pending[1];
    assert_eq!(last.block_height, 100);
    assert_eq!(last.value, serde_json::json!({"from": "10", "to": "20"}));
    assert_eq!(last.failures, 0);
}

#[tokio::test]
async fn scenario_initial_block_override_skips_early_records() {
    let mut cfg = config(5000);
    cfg.initial_block_height = Some(200);
    let mut h = harness(&cfg, &[]);

    let lines: Vec<String> = (150..=205)
        .map(|height| line(height, "A", "k1", r#"{"x":1}"#, false))
        .collect();
    let stats = run(&mut h.driver, &lines).await;

    assert_eq!(stats.skipped, 50); // 150..=199
    assert_eq!(stats.events_exported, 6); // 200..=205

    let state = h.storage.state().await.unwrap();
    assert_eq!(state.last_wasm_block_height_exported, 205);
    assert!(h
        .storage
        .latest_event_at("A", &wasmindex_core::keys::key_to_comma(b"k1"), 199)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn scenario_formula_failure_is_not_cached() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);
    run(&mut h.driver, &[line(10, "A", "k1", r#"{"x":1}"#, false)]).await;

    let err = h
        .query
        .compute("failing", "A", &BTreeMap::new(), Some(10))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Formula(_)));
    assert_eq!(h.storage.computation_count(), 0);
}

#[tokio::test]
async fn scenario_empty_flush_is_a_noop() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    h.driver.flush().await.unwrap();
    assert_eq!(h.driver.stats().flushes, 0);
    assert_eq!(h.storage.event_count(), 0);
}

#[tokio::test]
async fn flush_fires_only_on_block_boundary() {
    // Threshold 2, but three events share block 10: nothing may flush
    // mid-block. The first event of block 11 triggers the flush.
    let cfg = config(2);
    let mut h = harness(&cfg, &[]);

    h.driver
        .handle_line(&line(10, "A", "k1", r#"{"x":1}"#, false))
        .await
        .unwrap();
    h.driver
        .handle_line(&line(10, "A", "k2", r#"{"x":1}"#, false))
        .await
        .unwrap();
    h.driver
        .handle_line(&line(10, "B", "k1", r#"{"x":1}"#, false))
        .await
        .unwrap();
    assert_eq!(h.driver.stats().flushes, 0);
    assert_eq!(h.driver.pending_len(), 3);

    h.driver
        .handle_line(&line(11, "A", "k1", r#"{"x":2}"#, false))
        .await
        .unwrap();
    assert_eq!(h.driver.stats().flushes, 1);
    assert_eq!(h.driver.pending_len(), 1);

    // All of block 10 landed in the single flush.
    assert_eq!(h.storage.event_count(), 3);
}

#[tokio::test]
async fn replay_is_idempotent() {
    let lines = vec![
        line(10, "A", "k1", r#"{"x":1}"#, false),
        line(11, "A", "k1", r#"{"x":2}"#, false),
        line(11, "B", "k1", "\"v\"", false),
    ];

    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);
    run(&mut h.driver, &lines).await;
    let state_after_first = h.storage.state().await.unwrap();
    let count_after_first = h.storage.event_count();

    // A fresh driver over the same storage resumes past the checkpoint:
    // every replayed record is skipped and nothing changes.
    let mut driver2 = IngestDriver::new(
        h.storage.clone(),
        TransformerRegistry::with_default_rules(),
        ComputationCache::new(h.storage.clone(), registry(), "test-1"),
        None,
        h.search.clone(),
        &cfg,
    );
    let stats = run(&mut driver2, &lines).await;

    assert_eq!(stats.skipped, 3);
    assert_eq!(stats.events_exported, 0);
    assert_eq!(h.storage.event_count(), count_after_first);
    assert_eq!(h.storage.state().await.unwrap(), state_after_first);
}

#[tokio::test]
async fn block_events_may_be_reordered_across_contracts() {
    let forward = vec![
        line(10, "A", "k1", "\"1\"", false),
        line(10, "B", "k1", "\"2\"", false),
        line(10, "C", "k1", "\"3\"", false),
    ];
    let mut reversed = forward.clone();
    reversed.reverse();

    let cfg = config(5000);
    let mut h1 = harness(&cfg, &[]);
    run(&mut h1.driver, &forward).await;
    let mut h2 = harness(&cfg, &[]);
    run(&mut h2.driver, &reversed).await;

    for contract in ["A", "B", "C"] {
        let key = wasmindex_core::keys::key_to_comma(b"k1");
        let a = h1.storage.latest_event_at(contract, &key, 10).await.unwrap();
        let b = h2.storage.latest_event_at(contract, &key, 10).await.unwrap();
        assert_eq!(a, b);
    }
}

#[tokio::test]
async fn tombstone_as_first_write() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    run(&mut h.driver, &[line(10, "A", "k1", "", true)]).await;

    let key = wasmindex_core::keys::key_to_comma(b"k1");
    let row = h.storage.latest_event_at("A", &key, 10).await.unwrap().unwrap();
    assert!(row.deleted);
    assert!(row.value_json.is_none());
}

#[tokio::test]
async fn malformed_lines_are_reported_and_skipped() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    let stats = run(
        &mut h.driver,
        &[
            "not json at all".to_string(),
            r#"{"blockHeight": 10}"#.to_string(), // missing required fields
            line(10, "A", "k1", r#"{"x":1}"#, false),
        ],
    )
    .await;

    assert_eq!(stats.malformed, 2);
    assert_eq!(stats.events_exported, 1);
}

#[tokio::test]
async fn search_reindex_receives_changed_contracts() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    run(
        &mut h.driver,
        &[
            line(10, "A", "k1", "\"1\"", false),
            line(10, "B", "k1", "\"2\"", false),
        ],
    )
    .await;

    let calls = h.search.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn contract_code_id_updates_but_instantiation_sticks() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    run(&mut h.driver, &[line(10, "A", "k1", "\"1\"", false)]).await;

    // Same contract migrates to a new code id at a later block.
    let migrated = serde_json::json!({
        "blockHeight": 20,
        "blockTimeUnixMs": 20_000,
        "contractAddress": "A",
        "codeId": 2,
        "key": BASE64.encode(b"k1"),
        "value": BASE64.encode(b"\"2\""),
        "delete": false,
    })
    .to_string();
    run(&mut h.driver, &[migrated]).await;

    let contract = h.storage.contract("A").await.unwrap().unwrap();
    assert_eq!(contract.code_id, 2);
    assert_eq!(contract.instantiated_at_height, 10);
}

#[tokio::test]
async fn transformations_are_written_and_invalidate() {
    let cfg = config(5000);
    let mut h = harness(&cfg, &[]);

    // A write under the balance map produces a named transformation row.
    // Composite keys aren't valid UTF-8 in general, so the line is built
    // from the raw bytes rather than through the `line` helper.
    let mut key = wasmindex_core::keys::namespace_prefix(&[b"balance"]);
    key.extend_from_slice(b"juno1aaa");
    let raw = serde_json::json!({
        "blockHeight": 10,
        "blockTimeUnixMs": 10_000,
        "contractAddress": "A",
        "codeId": 1,
        "key": BASE64.encode(&key),
        "value": BASE64.encode(b"\"10\""),
        "delete": false,
    })
    .to_string();

    let stats = run(&mut h.driver, &[raw]).await;
    assert_eq!(stats.transformations, 1);

    let t = h
        .storage
        .latest_transformation_at("A", "balance:juno1aaa", 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.value, serde_json::json!("10"));
}
