//! Webhook delivery.
//!
//! `fire()` performs one protocol-appropriate delivery attempt for a
//! pending row: success deletes the row, failure increments its counter and
//! propagates. `drain()` is the retrying caller: a bounded-concurrency pass
//! over the queue with exponential backoff keyed on each row's failure
//! count.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use wasmindex_core::config::SoketiConfig;
use wasmindex_core::store::Storage;
use wasmindex_core::types::{Endpoint, PendingWebhook};

use crate::error::WebhookError;
use crate::retry::RetryPolicy;
use crate::soketi::SoketiClient;

/// Default headers merged into every HTTP delivery (overridable per
/// endpoint).
const ACCEPT_ENCODING: &str = "gzip,deflate,compress";

/// Outcome counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers pending webhooks over HTTP and Soketi.
pub struct WebhookDeliverer {
    storage: Arc<dyn Storage>,
    http: reqwest::Client,
    soketi: Option<SoketiClient>,
    retry: RetryPolicy,
}

impl WebhookDeliverer {
    pub fn new(
        storage: Arc<dyn Storage>,
        soketi: Option<&SoketiConfig>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self, WebhookError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WebhookError::Delivery {
                status: None,
                reason: format!("building http client: {e}"),
            })?;
        let soketi = soketi.map(|cfg| SoketiClient::new(http.clone(), cfg));
        Ok(Self {
            storage,
            http,
            soketi,
            retry,
        })
    }

    /// One delivery attempt. Deletes the row on success; on failure the row
    /// is kept with an incremented failure count and the error re-raised.
    pub async fn fire(&self, hook: &PendingWebhook) -> Result<(), WebhookError> {
        match self.deliver(hook).await {
            Ok(()) => {
                self.storage.delete_webhook(hook.id).await?;
                debug!(id = hook.id, "webhook delivered");
                Ok(())
            }
            Err(e) => {
                let failures = self.storage.record_webhook_failure(hook.id).await?;
                warn!(id = hook.id, failures, error = %e, "webhook delivery failed");
                Err(e)
            }
        }
    }

    async fn deliver(&self, hook: &PendingWebhook) -> Result<(), WebhookError> {
        match &hook.endpoint {
            Endpoint::Url {
                method,
                headers,
                url,
            } => {
                let method = reqwest::Method::from_bytes(method.as_bytes())
                    .map_err(|_| WebhookError::InvalidEndpoint(format!("method '{method}'")))?;

                let mut request = self
                    .http
                    .request(method, url)
                    .header(reqwest::header::ACCEPT_ENCODING, ACCEPT_ENCODING)
                    .json(&hook.value);
                for (name, value) in headers {
                    request = request.header(name, value);
                }

                let response = request.send().await.map_err(|e| WebhookError::Delivery {
                    status: None,
                    reason: e.to_string(),
                })?;

                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let reason = response.text().await.unwrap_or_default();
                    return Err(WebhookError::Delivery {
                        status: Some(status),
                        reason,
                    });
                }
                Ok(())
            }
            Endpoint::Soketi { channel, event } => {
                let client = self.soketi.as_ref().ok_or(WebhookError::SoketiNotConfigured)?;
                client.publish(channel, event, &hook.value).await
            }
        }
    }

    /// Drain up to `limit` pending rows with bounded concurrency. Rows that
    /// have failed before wait out their backoff delay first; rows that fail
    /// here stay queued for the next pass.
    pub async fn drain(&self, limit: i64, concurrency: usize) -> Result<DrainStats, WebhookError> {
        let pending = self.storage.pending_webhooks(limit).await?;
        if pending.is_empty() {
            return Ok(DrainStats::default());
        }

        let attempted = pending.len();
        let outcomes: Vec<bool> = stream::iter(pending)
            .map(|hook| async move {
                let delay = self.retry.delay_for(hook.failures);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.fire(&hook).await.is_ok()
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        Ok(DrainStats {
            attempted,
            delivered,
            failed: attempted - delivered,
        })
    }
}
