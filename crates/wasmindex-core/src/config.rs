//! Indexer configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Event stream sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Path of the WASM state-write event stream ("-" = stdin).
    #[serde(default)]
    pub wasm: Option<PathBuf>,
}

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// PostgreSQL URL, e.g. "postgresql://localhost/wasmindex"
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

/// Soketi (Pusher-protocol) connection settings for webhook publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoketiConfig {
    pub host: String,
    pub app_id: String,
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub use_tls: bool,
}

/// How a config-defined webhook resolves its payload value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebhookValueMode {
    /// The event's value as-is.
    #[default]
    Raw,
    /// `{ "from": previous, "to": current }`.
    Change,
}

/// A config-defined webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookEndpointConfig {
    Url {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Soketi {
        channel: String,
        event: String,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

/// A webhook subscription loaded from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Restrict to these contract addresses (empty = all).
    #[serde(default)]
    pub contract_addresses: Vec<String>,
    /// Restrict to these code ids (empty = all).
    #[serde(default)]
    pub code_ids: Vec<u64>,
    /// UTF-8 prefix matched against the decoded key bytes, e.g. "balance:".
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub value: WebhookValueMode,
    pub endpoint: WebhookEndpointConfig,
}

/// Log level per component, passed to the tracing setup in the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: HashMap::new(),
            json: false,
        }
    }
}

/// Top-level indexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
    pub db: DbConfig,
    /// Chain id exposed to formulas via the evaluation environment.
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    /// Pending-buffer flush threshold (events).
    #[serde(default = "default_batch")]
    pub batch: usize,
    /// Override the resume height (default: checkpoint + 1).
    #[serde(default)]
    pub initial_block_height: Option<u64>,
    /// Run computation-cache invalidation during flushes.
    #[serde(default = "bool_true")]
    pub cache_updates: bool,
    /// Evaluate webhook subscriptions during flushes.
    #[serde(default = "bool_true")]
    pub webhooks_enabled: bool,
    #[serde(default)]
    pub soketi: Option<SoketiConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_chain_id() -> String {
    "wasm-1".to_string()
}

fn default_batch() -> usize {
    5000
}

fn bool_true() -> bool {
    true
}

impl IndexerConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: IndexerConfig =
            serde_json::from_str(r#"{"db": {"url": "postgresql://localhost/x"}}"#).unwrap();
        assert_eq!(cfg.batch, 5000);
        assert!(cfg.cache_updates);
        assert!(cfg.webhooks_enabled);
        assert!(cfg.initial_block_height.is_none());
        assert_eq!(cfg.db.max_connections, 10);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn webhook_endpoint_variants_parse() {
        let url: WebhookEndpointConfig =
            serde_json::from_str(r#"{"type":"url","url":"https://example.com/hook"}"#).unwrap();
        assert!(matches!(url, WebhookEndpointConfig::Url { ref method, .. } if method == "POST"));

        let soketi: WebhookEndpointConfig =
            serde_json::from_str(r#"{"type":"soketi","channel":"balances","event":"changed"}"#)
                .unwrap();
        assert!(matches!(soketi, WebhookEndpointConfig::Soketi { .. }));
    }

    #[test]
    fn unknown_endpoint_type_is_rejected() {
        let res: Result<WebhookEndpointConfig, _> =
            serde_json::from_str(r#"{"type":"carrier-pigeon","coop":"roof"}"#);
        assert!(res.is_err());
    }
}
