//! Shared types for the indexing pipeline.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::keys::base64_key_to_event_key;

// ─── Blocks ───────────────────────────────────────────────────────────────────

/// A height-indexed point in the chain's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub time_unix_ms: u64,
}

impl Block {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time_unix_ms as i64)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

/// The environment a formula evaluation is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEnv {
    pub block_height: u64,
    pub block_time_unix_ms: u64,
    pub chain_id: String,
}

// ─── Contracts ────────────────────────────────────────────────────────────────

/// A contract observed in the event stream.
///
/// `code_id` changes on chain migration; the `instantiated_at_*` columns are
/// write-once and reflect the earliest event ever observed for the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub address: String,
    pub code_id: u64,
    pub instantiated_at_height: u64,
    pub instantiated_at_time_unix_ms: u64,
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// A raw state-write record as emitted by the chain node, one JSON object
/// per stream line. `key` and `value` are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWasmEvent {
    pub block_height: u64,
    pub block_time_unix_ms: u64,
    pub contract_address: String,
    pub code_id: u64,
    pub key: String,
    pub value: String,
    pub delete: bool,
}

/// A normalized contract state write (or tombstone).
///
/// `key` is the canonical comma-decimal form; `value_json` is the parsed
/// UTF-8 JSON of `value` when parsing succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasmEvent {
    pub block_height: u64,
    pub block_time_unix_ms: u64,
    pub contract_address: String,
    pub code_id: u64,
    pub key: String,
    pub value: Option<String>,
    pub value_json: Option<serde_json::Value>,
    pub deleted: bool,
}

impl WasmEvent {
    /// Normalize a raw stream record: decode the key to canonical form,
    /// decode the value from base64 to UTF-8, and attempt a silent JSON
    /// parse of the value.
    pub fn from_raw(raw: &RawWasmEvent) -> Result<Self, ParseError> {
        let key = base64_key_to_event_key(&raw.key)?;

        let (value, value_json) = if raw.delete {
            (None, None)
        } else {
            let bytes = BASE64.decode(&raw.value).map_err(|e| ParseError::Base64 {
                field: "value".into(),
                reason: e.to_string(),
            })?;
            let text = String::from_utf8(bytes).map_err(|_| ParseError::Utf8)?;
            let json = serde_json::from_str::<serde_json::Value>(&text).ok();
            (Some(text), json)
        };

        Ok(Self {
            block_height: raw.block_height,
            block_time_unix_ms: raw.block_time_unix_ms,
            contract_address: raw.contract_address.clone(),
            code_id: raw.code_id,
            key,
            value,
            value_json,
            deleted: raw.delete,
        })
    }

    /// The value a reader sees: parsed JSON when available, else the raw
    /// string, and `None` for tombstones.
    pub fn read_value(&self) -> Option<serde_json::Value> {
        if self.deleted {
            return None;
        }
        self.value_json
            .clone()
            .or_else(|| self.value.clone().map(serde_json::Value::String))
    }
}

/// An event row joined with its contract, as returned by the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredWasmEvent {
    pub event: WasmEvent,
    pub contract: Contract,
}

// ─── Transformations ──────────────────────────────────────────────────────────

/// A rule-derived normalized projection of a raw event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub block_height: u64,
    pub contract_address: String,
    pub name: String,
    pub value: serde_json::Value,
}

// ─── Computations ─────────────────────────────────────────────────────────────

/// A cached formula output over a contiguous block range.
///
/// `output` is the value of the formula for every height in
/// `[block_height_valid, block_height_latest]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub id: i64,
    pub formula: String,
    pub target_contract: String,
    pub args: String,
    pub block_height_valid: u64,
    pub block_height_latest: u64,
    pub output: serde_json::Value,
}

/// A computation row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewComputation {
    pub formula: String,
    pub target_contract: String,
    pub args: String,
    pub block_height_valid: u64,
    pub block_height_latest: u64,
    pub output: serde_json::Value,
}

/// One run of equal outputs from a range evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRun {
    pub block_valid: u64,
    pub block_latest: u64,
    pub output: serde_json::Value,
}

/// Canonicalize formula args: key-sorted JSON of the mapping.
///
/// `BTreeMap` iterates in key order, so its JSON rendering is the canonical
/// form directly.
pub fn canonicalize_args(args: &BTreeMap<String, String>) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string())
}

// ─── State ────────────────────────────────────────────────────────────────────

/// Singleton pipeline checkpoint row. All fields advance with monotonic max.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub last_wasm_block_height_exported: u64,
    pub latest_block_height: u64,
    pub latest_block_time_unix_ms: u64,
}

// ─── Webhooks ─────────────────────────────────────────────────────────────────

/// Where a webhook delivery goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Endpoint {
    Url {
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        url: String,
    },
    Soketi {
        channel: String,
        event: String,
    },
}

/// A delivery waiting in the queue. Deleted on success; `failures` counts
/// unsuccessful attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWebhook {
    pub id: i64,
    pub block_height: u64,
    pub contract_address: String,
    pub key: String,
    pub endpoint: Endpoint,
    pub value: serde_json::Value,
    pub failures: u32,
}

/// A pending webhook about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingWebhook {
    pub block_height: u64,
    pub contract_address: String,
    pub key: String,
    pub endpoint: Endpoint,
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(key_b64: &str, value_b64: &str, delete: bool) -> RawWasmEvent {
        RawWasmEvent {
            block_height: 10,
            block_time_unix_ms: 1_700_000_000_000,
            contract_address: "juno1contract".into(),
            code_id: 42,
            key: key_b64.into(),
            value: value_b64.into(),
            delete,
        }
    }

    #[test]
    fn from_raw_parses_json_value() {
        // key "k1", value {"x":1}
        let e = WasmEvent::from_raw(&raw("azE=", "eyJ4IjoxfQ==", false)).unwrap();
        assert_eq!(e.key, "107,49");
        assert_eq!(e.value.as_deref(), Some(r#"{"x":1}"#));
        assert_eq!(e.value_json, Some(serde_json::json!({"x": 1})));
        assert!(!e.deleted);
    }

    #[test]
    fn from_raw_non_json_value_keeps_string() {
        // value "plain"
        let e = WasmEvent::from_raw(&raw("azE=", "cGxhaW4=", false)).unwrap();
        assert_eq!(e.value.as_deref(), Some("plain"));
        assert!(e.value_json.is_none());
        assert_eq!(
            e.read_value(),
            Some(serde_json::Value::String("plain".into()))
        );
    }

    #[test]
    fn from_raw_delete_is_tombstone() {
        let e = WasmEvent::from_raw(&raw("azE=", "", true)).unwrap();
        assert!(e.deleted);
        assert!(e.value.is_none());
        assert!(e.value_json.is_none());
        assert!(e.read_value().is_none());
    }

    #[test]
    fn raw_event_deserializes_camel_case() {
        let line = r#"{"blockHeight":10,"blockTimeUnixMs":1,"contractAddress":"a","codeId":1,"key":"azE=","value":"","delete":true,"extraField":7}"#;
        let raw: RawWasmEvent = serde_json::from_str(line).unwrap();
        assert_eq!(raw.block_height, 10);
        assert!(raw.delete);
    }

    #[test]
    fn args_canonicalization_is_key_sorted() {
        let mut args = BTreeMap::new();
        args.insert("b".to_string(), "2".to_string());
        args.insert("a".to_string(), "1".to_string());
        assert_eq!(canonicalize_args(&args), r#"{"a":"1","b":"2"}"#);
    }
}
