//! Webhook subscriptions.
//!
//! A subscription filters newly persisted events, resolves a payload value
//! (optionally reading the previous value for the same key), and names the
//! endpoint the payload goes to.

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use wasmindex_core::config::{SoketiConfig, WebhookConfig, WebhookEndpointConfig, WebhookValueMode};
use wasmindex_core::keys::{key_matches_prefix, key_to_comma};
use wasmindex_core::store::Storage;
use wasmindex_core::types::{Endpoint, StoredWasmEvent, WasmEvent};

use crate::error::WebhookError;

/// Lazy, memoized handle to the previous value for an event's
/// `(contract, key)` — the most recent write at a strictly lower block.
///
/// The current batch is scanned first, then the event store. The lookup
/// only happens if a subscription actually calls [`PreviousValue::get`].
pub struct PreviousValue<'a> {
    storage: &'a dyn Storage,
    batch: &'a [StoredWasmEvent],
    contract: &'a str,
    key: &'a str,
    block_height: u64,
    cached: OnceCell<Option<serde_json::Value>>,
}

impl<'a> PreviousValue<'a> {
    pub fn new(storage: &'a dyn Storage, batch: &'a [StoredWasmEvent], event: &'a WasmEvent) -> Self {
        Self {
            storage,
            batch,
            contract: &event.contract_address,
            key: &event.key,
            block_height: event.block_height,
            cached: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<Option<serde_json::Value>, WebhookError> {
        self.cached
            .get_or_try_init(|| async {
                // Same contract, same key, strictly lower block — first in
                // the in-flight batch, then the store.
                let in_batch = self
                    .batch
                    .iter()
                    .map(|s| &s.event)
                    .filter(|e| {
                        e.contract_address == self.contract
                            && e.key == self.key
                            && e.block_height < self.block_height
                    })
                    .max_by_key(|e| e.block_height);

                if let Some(event) = in_batch {
                    return Ok(event.read_value());
                }

                let stored = self
                    .storage
                    .previous_event(self.contract, self.key, self.block_height)
                    .await?;
                Ok::<_, WebhookError>(stored.and_then(|e| e.read_value()))
            })
            .await
            .map(|v| v.clone())
    }
}

/// A webhook subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn id(&self) -> &str;

    /// Should this event produce a delivery?
    fn matches(&self, event: &StoredWasmEvent) -> bool;

    /// Resolve the payload. `None` skips the event for this subscription.
    async fn value(
        &self,
        event: &StoredWasmEvent,
        prev: &PreviousValue<'_>,
    ) -> Result<Option<serde_json::Value>, WebhookError>;

    /// Resolve the endpoint. `None` skips the event for this subscription.
    fn endpoint(&self, event: &StoredWasmEvent) -> Option<Endpoint>;
}

/// A subscription built from a `webhooks` config entry.
pub struct ConfigSubscription {
    id: String,
    contract_addresses: Vec<String>,
    code_ids: Vec<u64>,
    /// Canonical comma form of the configured UTF-8 key prefix.
    key_prefix: Option<String>,
    value_mode: WebhookValueMode,
    endpoint: WebhookEndpointConfig,
    soketi_configured: bool,
}

impl ConfigSubscription {
    pub fn new(index: usize, cfg: &WebhookConfig, soketi_configured: bool) -> Self {
        Self {
            id: format!("webhook-{index}"),
            contract_addresses: cfg.contract_addresses.clone(),
            code_ids: cfg.code_ids.clone(),
            key_prefix: cfg
                .key_prefix
                .as_ref()
                .map(|p| key_to_comma(p.as_bytes())),
            value_mode: cfg.value,
            endpoint: cfg.endpoint.clone(),
            soketi_configured,
        }
    }
}

#[async_trait]
impl Subscription for ConfigSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, event: &StoredWasmEvent) -> bool {
        if !self.contract_addresses.is_empty()
            && !self
                .contract_addresses
                .contains(&event.event.contract_address)
        {
            return false;
        }
        if !self.code_ids.is_empty() && !self.code_ids.contains(&event.event.code_id) {
            return false;
        }
        match &self.key_prefix {
            Some(prefix) => key_matches_prefix(&event.event.key, prefix),
            None => true,
        }
    }

    async fn value(
        &self,
        event: &StoredWasmEvent,
        prev: &PreviousValue<'_>,
    ) -> Result<Option<serde_json::Value>, WebhookError> {
        match self.value_mode {
            WebhookValueMode::Raw => Ok(event.event.read_value()),
            WebhookValueMode::Change => {
                let from = prev.get().await?.unwrap_or(serde_json::Value::Null);
                let to = event.event.read_value().unwrap_or(serde_json::Value::Null);
                Ok(Some(serde_json::json!({ "from": from, "to": to })))
            }
        }
    }

    fn endpoint(&self, _event: &StoredWasmEvent) -> Option<Endpoint> {
        match &self.endpoint {
            WebhookEndpointConfig::Url {
                url,
                method,
                headers,
            } => Some(Endpoint::Url {
                method: method.clone(),
                headers: headers.clone(),
                url: url.clone(),
            }),
            WebhookEndpointConfig::Soketi { channel, event } => {
                if !self.soketi_configured {
                    debug!(subscription = %self.id, "soketi endpoint without soketi config, skipping");
                    return None;
                }
                Some(Endpoint::Soketi {
                    channel: channel.clone(),
                    event: event.clone(),
                })
            }
        }
    }
}

/// Build the subscription set from config.
pub fn subscriptions_from_config(
    webhooks: &[WebhookConfig],
    soketi: Option<&SoketiConfig>,
) -> Vec<Box<dyn Subscription>> {
    webhooks
        .iter()
        .enumerate()
        .map(|(i, cfg)| {
            Box::new(ConfigSubscription::new(i, cfg, soketi.is_some())) as Box<dyn Subscription>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wasmindex_core::types::Contract;
    use wasmindex_storage::MemoryStorage;

    fn stored(contract: &str, key_bytes: &[u8], height: u64, value: &str) -> StoredWasmEvent {
        StoredWasmEvent {
            event: WasmEvent {
                block_height: height,
                block_time_unix_ms: height * 1000,
                contract_address: contract.into(),
                code_id: 1,
                key: key_to_comma(key_bytes),
                value: Some(value.into()),
                value_json: serde_json::from_str(value).ok(),
                deleted: false,
            },
            contract: Contract {
                address: contract.into(),
                code_id: 1,
                instantiated_at_height: 1,
                instantiated_at_time_unix_ms: 1000,
            },
        }
    }

    fn change_subscription(key_prefix: &str) -> ConfigSubscription {
        ConfigSubscription::new(
            0,
            &WebhookConfig {
                contract_addresses: vec![],
                code_ids: vec![],
                key_prefix: Some(key_prefix.into()),
                value: WebhookValueMode::Change,
                endpoint: WebhookEndpointConfig::Url {
                    url: "https://example.com/hook".into(),
                    method: "POST".into(),
                    headers: BTreeMap::new(),
                },
            },
            false,
        )
    }

    #[test]
    fn key_prefix_filter_matches_decoded_bytes() {
        let sub = change_subscription("balance:");
        assert!(sub.matches(&stored("c1", b"balance:X", 100, "\"10\"")));
        assert!(!sub.matches(&stored("c1", b"total", 100, "\"10\"")));
    }

    #[tokio::test]
    async fn change_value_reads_previous_from_batch() {
        let storage = MemoryStorage::new();
        let batch = vec![
            stored("c1", b"balance:X", 99, "\"10\""),
            stored("c1", b"balance:X", 100, "\"20\""),
        ];
        let sub = change_subscription("balance:");

        let prev = PreviousValue::new(&storage, &batch, &batch[1].event);
        let value = sub.value(&batch[1], &prev).await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"from": "10", "to": "20"}));
    }

    #[tokio::test]
    async fn change_value_falls_back_to_store() {
        use wasmindex_core::store::EventStore;

        let storage = MemoryStorage::new();
        let older = stored("c1", b"balance:X", 50, "\"10\"");
        storage.upsert_contracts(&[older.event.clone()]).await.unwrap();
        storage.upsert_events(&[older.event.clone()]).await.unwrap();

        let batch = vec![stored("c1", b"balance:X", 100, "\"20\"")];
        let sub = change_subscription("balance:");

        let prev = PreviousValue::new(&storage, &batch, &batch[0].event);
        let value = sub.value(&batch[0], &prev).await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"from": "10", "to": "20"}));
    }

    #[test]
    fn soketi_endpoint_skipped_without_config() {
        let sub = ConfigSubscription::new(
            0,
            &WebhookConfig {
                contract_addresses: vec![],
                code_ids: vec![],
                key_prefix: None,
                value: WebhookValueMode::Raw,
                endpoint: WebhookEndpointConfig::Soketi {
                    channel: "balances".into(),
                    event: "changed".into(),
                },
            },
            false,
        );
        assert!(sub.endpoint(&stored("c1", b"k", 1, "1")).is_none());
    }
}
