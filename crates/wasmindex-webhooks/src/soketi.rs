//! Soketi publisher — a Pusher-protocol HTTP client.
//!
//! Publishes webhook payloads on a `(channel, event)` pair via the Pusher
//! HTTP API: the request carries an MD5 checksum of the body and an
//! HMAC-SHA256 signature over the method, path, and sorted query string.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

use wasmindex_core::config::SoketiConfig;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Pusher-compatible publisher for a single Soketi app.
pub struct SoketiClient {
    http: reqwest::Client,
    host: String,
    app_id: String,
    key: String,
    secret: String,
    use_tls: bool,
}

impl SoketiClient {
    pub fn new(http: reqwest::Client, config: &SoketiConfig) -> Self {
        Self {
            http,
            host: config.host.clone(),
            app_id: config.app_id.clone(),
            key: config.key.clone(),
            secret: config.secret.clone(),
            use_tls: config.use_tls,
        }
    }

    /// Publish `data` as `event` on `channel`.
    pub async fn publish(
        &self,
        channel: &str,
        event: &str,
        data: &serde_json::Value,
    ) -> Result<(), WebhookError> {
        let body = serde_json::to_string(&serde_json::json!({
            "name": event,
            "channel": channel,
            "data": data.to_string(),
        }))?;

        let url = self.signed_url(&body, chrono::Utc::now().timestamp())?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| WebhookError::Delivery {
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

    /// Build the signed event-publish URL for a request body.
    ///
    /// Query params must appear in byte order when signed; the four auth
    /// params happen to already sort alphabetically.
    fn signed_url(&self, body: &str, timestamp: i64) -> Result<String, WebhookError> {
        let body_md5 = hex::encode(Md5::digest(body.as_bytes()));
        let path = format!("/apps/{}/events", self.app_id);
        let query = format!(
            "auth_key={}&auth_timestamp={}&auth_version=1.0&body_md5={}",
            self.key, timestamp, body_md5
        );

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| WebhookError::InvalidEndpoint(format!("soketi secret: {e}")))?;
        mac.update(format!("POST\n{path}\n{query}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let scheme = if self.use_tls { "https" } else { "http" };
        Ok(format!(
            "{scheme}://{}{path}?{query}&auth_signature={signature}",
            self.host
        ))
    }
}
