//! Stock formulas.
//!
//! Generic state accessors plus the voting-power family. Custom formulas
//! register through [`crate::runtime::FormulaRegistry::register`].

mod voting;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use wasmindex_core::error::FormulaError;
use wasmindex_core::keys::namespace_prefix;

use crate::runtime::{Formula, FormulaEnv};

pub use voting::{TotalPower, VotingPower};

/// The default formula set.
pub fn defaults() -> Vec<Arc<dyn Formula>> {
    vec![
        Arc::new(Item),
        Arc::new(Map),
        Arc::new(ContractInfo),
        Arc::new(Config),
        Arc::new(InstantiatedAt),
        Arc::new(VotingPower),
        Arc::new(TotalPower),
    ]
}

fn require_arg<'a>(
    args: &'a BTreeMap<String, String>,
    name: &str,
) -> Result<&'a str, FormulaError> {
    args.get(name)
        .map(|s| s.as_str())
        .ok_or_else(|| FormulaError::MissingArg(name.to_string()))
}

/// Generic point read: the target contract's item at `args.key`.
pub struct Item;

#[async_trait]
impl Formula for Item {
    fn name(&self) -> &'static str {
        "item"
    }

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        let key = require_arg(args, "key")?;
        let value = env.get_self(key.as_bytes()).await?;
        Ok(value.unwrap_or(serde_json::Value::Null))
    }
}

/// Generic range read: the target contract's map under `args.prefix`.
pub struct Map;

#[async_trait]
impl Formula for Map {
    fn name(&self) -> &'static str {
        "map"
    }

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        let prefix = require_arg(args, "prefix")?;
        let contract = env.contract_address().to_string();
        let entries = env
            .get_map(&contract, &namespace_prefix(&[prefix.as_bytes()]))
            .await?;
        Ok(serde_json::Value::Object(entries.into_iter().collect()))
    }
}

/// The contract's `contract_info` item (name and version the contract
/// reported at instantiation). Drives dispatch in the voting formulas.
pub struct ContractInfo;

#[async_trait]
impl Formula for ContractInfo {
    fn name(&self) -> &'static str {
        "contract_info"
    }

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        _args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        let info = env.get_self(b"contract_info").await?;
        Ok(info.unwrap_or(serde_json::Value::Null))
    }
}

/// The contract config, probing key variants newest-first.
pub struct Config;

#[async_trait]
impl Formula for Config {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        _args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        if let Some(v2) = env.get_self(b"config_v2").await? {
            return Ok(v2);
        }
        Ok(env.get_self(b"config").await?.unwrap_or(serde_json::Value::Null))
    }
}

/// RFC 3339 timestamp of the contract's first `contract_info` write.
pub struct InstantiatedAt;

#[async_trait]
impl Formula for InstantiatedAt {
    fn name(&self) -> &'static str {
        "instantiated_at"
    }

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        _args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        let contract = env.contract_address().to_string();
        let created = env.get_created_at(&contract, b"contract_info").await?;
        Ok(created
            .map(|t| serde_json::Value::String(t.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null))
    }
}
