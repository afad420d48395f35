//! Matches persisted events against subscriptions and enqueues deliveries.

use std::sync::Arc;

use tracing::{debug, warn};

use wasmindex_core::store::Storage;
use wasmindex_core::types::{NewPendingWebhook, StoredWasmEvent};

use crate::error::WebhookError;
use crate::subscription::{PreviousValue, Subscription};

/// Evaluates every subscription against a flush's stored events.
///
/// Failures are isolated per `(event, subscription)` pair: a throwing
/// subscription is logged and skipped, everything else proceeds.
pub struct WebhookDispatcher {
    storage: Arc<dyn Storage>,
    subscriptions: Vec<Box<dyn Subscription>>,
}

impl WebhookDispatcher {
    pub fn new(storage: Arc<dyn Storage>, subscriptions: Vec<Box<dyn Subscription>>) -> Self {
        Self {
            storage,
            subscriptions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Enqueue pending webhooks for a batch of newly persisted events.
    /// Returns the number of rows enqueued.
    pub async fn enqueue(&self, batch: &[StoredWasmEvent]) -> Result<u64, WebhookError> {
        if self.subscriptions.is_empty() || batch.is_empty() {
            return Ok(0);
        }

        let mut rows: Vec<NewPendingWebhook> = Vec::new();
        for stored in batch {
            for sub in &self.subscriptions {
                if !sub.matches(stored) {
                    continue;
                }

                let prev = PreviousValue::new(self.storage.as_ref(), batch, &stored.event);
                let value = match sub.value(stored, &prev).await {
                    Ok(Some(value)) => value,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(
                            subscription = sub.id(),
                            contract = %stored.event.contract_address,
                            key = %stored.event.key,
                            error = %e,
                            "webhook value evaluation failed, skipping"
                        );
                        continue;
                    }
                };

                let Some(endpoint) = sub.endpoint(stored) else {
                    continue;
                };

                rows.push(NewPendingWebhook {
                    block_height: stored.event.block_height,
                    contract_address: stored.event.contract_address.clone(),
                    key: stored.event.key.clone(),
                    endpoint,
                    value,
                });
            }
        }

        let enqueued = self.storage.enqueue_webhooks(&rows).await?;
        if enqueued > 0 {
            debug!(enqueued, "webhooks enqueued");
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wasmindex_core::config::{WebhookConfig, WebhookEndpointConfig, WebhookValueMode};
    use wasmindex_core::keys::key_to_comma;
    use wasmindex_core::store::{EventStore, WebhookQueue};
    use wasmindex_core::types::{Contract, WasmEvent};
    use wasmindex_storage::MemoryStorage;

    use crate::subscription::subscriptions_from_config;

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

    #[tokio::test]
    async fn enqueues_change_payload_with_previous_value() {
        let storage = Arc::new(MemoryStorage::new());
        let older = stored("c1", b"balance:X", 50, "\"10\"");
        storage.upsert_contracts(&[older.event.clone()]).await.unwrap();
        storage.upsert_events(&[older.event.clone()]).await.unwrap();

        let subs = subscriptions_from_config(
            &[WebhookConfig {
                contract_addresses: vec![],
                code_ids: vec![],
                key_prefix: Some("balance:".into()),
                value: WebhookValueMode::Change,
                endpoint: WebhookEndpointConfig::Url {
                    url: "https://example.com/hook".into(),
                    method: "POST".into(),
                    headers: BTreeMap::new(),
                },
            }],
            None,
        );
        let dispatcher = WebhookDispatcher::new(storage.clone(), subs);

        let batch = vec![stored("c1", b"balance:X", 100, "\"20\"")];
        let enqueued = dispatcher.enqueue(&batch).await.unwrap();
        assert_eq!(enqueued, 1);

        let pending = storage.pending_webhooks(10).await.unwrap();
        assert_eq!(pending[0].value, serde_json::json!({"from": "10", "to": "20"}));
        assert_eq!(pending[0].failures, 0);
    }

    #[tokio::test]
    async fn non_matching_events_enqueue_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let subs = subscriptions_from_config(
            &[WebhookConfig {
                contract_addresses: vec!["other-contract".into()],
                code_ids: vec![],
                key_prefix: None,
                value: WebhookValueMode::Raw,
                endpoint: WebhookEndpointConfig::Url {
                    url: "https://example.com/hook".into(),
                    method: "POST".into(),
                    headers: BTreeMap::new(),
                },
            }],
            None,
        );
        let dispatcher = WebhookDispatcher::new(storage.clone(), subs);

        let enqueued = dispatcher
            .enqueue(&[stored("c1", b"k", 10, "\"v\"")])
            .await
            .unwrap();
        assert_eq!(enqueued, 0);
    }
}
