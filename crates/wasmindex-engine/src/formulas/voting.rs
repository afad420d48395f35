//! Voting-power formulas.
//!
//! `voting_power` and `total_power` are polymorphic over the voting module
//! a DAO uses: they read the target's `contract_info.contract` field and
//! dispatch to the sub-formula for that contract family.

use std::collections::BTreeMap;

use async_trait::async_trait;

use wasmindex_core::error::FormulaError;
use wasmindex_core::keys::namespace_prefix;

use crate::runtime::{Formula, FormulaEnv};

/// Contract families the voting formulas understand, keyed by the canonical
/// name a contract reports in `contract_info.contract` (the `crates.io:`
/// prefix is stripped before lookup).
const CW4_VOTING: &str = "cw4-voting";
const CW20_STAKED_VOTING: &str = "cw20-staked-balance-voting";

async fn canonical_contract_name(env: &FormulaEnv<'_>) -> Result<String, FormulaError> {
    let info = env.get_self(b"contract_info").await?;
    let name = info
        .as_ref()
        .and_then(|i| i.get("contract"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| FormulaError::Other("contract_info has no contract name".into()))?;
    Ok(name.strip_prefix("crates.io:").unwrap_or(name).to_string())
}

async fn linked_contract(env: &FormulaEnv<'_>, key: &[u8]) -> Result<String, FormulaError> {
    env.get_self(key)
        .await?
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| {
            FormulaError::Other(format!(
                "missing linked contract item '{}'",
                String::from_utf8_lossy(key)
            ))
        })
}

/// A member or staker's voting power at the pinned block.
///
/// Args: `address` — the voter.
pub struct VotingPower;

#[async_trait]
impl Formula for VotingPower {
    fn name(&self) -> &'static str {
        "voting_power"
    }

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        let address = args
            .get("address")
            .ok_or_else(|| FormulaError::MissingArg("address".to_string()))?;

        match canonical_contract_name(env).await?.as_str() {
            CW4_VOTING => {
                let group = linked_contract(env, b"group_contract").await?;
                let mut key = namespace_prefix(&[b"members"]);
                key.extend_from_slice(address.as_bytes());
                let weight = env.get(&group, &key).await?;
                Ok(weight.unwrap_or(serde_json::json!(0)))
            }
            CW20_STAKED_VOTING => {
                let staking = linked_contract(env, b"staking_contract").await?;
                let mut key = namespace_prefix(&[b"staked_balances"]);
                key.extend_from_slice(address.as_bytes());
                let staked = env.get(&staking, &key).await?;
                Ok(staked.unwrap_or(serde_json::json!("0")))
            }
            other => Err(FormulaError::UnsupportedContract {
                formula: "voting_power".into(),
                contract: other.to_string(),
            }),
        }
    }
}

/// The total voting power in the DAO at the pinned block.
pub struct TotalPower;

#[async_trait]
impl Formula for TotalPower {
    fn name(&self) -> &'static str {
        "total_power"
    }

    async fn compute(
        &self,
        env: &FormulaEnv<'_>,
        _args: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, FormulaError> {
        match canonical_contract_name(env).await?.as_str() {
            CW4_VOTING => {
                let group = linked_contract(env, b"group_contract").await?;
                let total = env.get(&group, b"total").await?;
                Ok(total.unwrap_or(serde_json::json!(0)))
            }
            CW20_STAKED_VOTING => {
                let staking = linked_contract(env, b"staking_contract").await?;
                let total = env.get(&staking, b"total_staked").await?;
                Ok(total.unwrap_or(serde_json::json!("0")))
            }
            other => Err(FormulaError::UnsupportedContract {
                formula: "total_power".into(),
                contract: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmindex_core::dependency::Dependency;
    use wasmindex_core::keys::key_to_comma;
    use wasmindex_core::store::EventStore;
    use wasmindex_core::types::WasmEvent;
    use wasmindex_storage::MemoryStorage;

    use crate::runtime::{block_env_at, FormulaRegistry};

    fn event(contract: &str, key: &[u8], height: u64, value: &str) -> WasmEvent {
        WasmEvent {
            block_height: height,
            block_time_unix_ms: height * 1000,
            contract_address: contract.into(),
            code_id: 1,
            key: key_to_comma(key),
            value: Some(value.into()),
            value_json: serde_json::from_str(value).ok(),
            deleted: false,
        }
    }

    async fn seed_cw4(storage: &MemoryStorage) {
        let mut member_key = namespace_prefix(&[b"members"]);
        member_key.extend_from_slice(b"juno1voter");
        let events = vec![
            event(
                "dao-voting",
                b"contract_info",
                5,
                r#"{"contract":"crates.io:cw4-voting","version":"0.2.0"}"#,
            ),
            event("dao-voting", b"group_contract", 5, r#""cw4-group""#),
            event("cw4-group", &member_key, 6, "7"),
            event("cw4-group", b"total", 6, "10"),
        ];
        storage.upsert_contracts(&events).await.unwrap();
        storage.upsert_events(&events).await.unwrap();
    }

    async fn run(
        storage: &MemoryStorage,
        name: &str,
        contract: &str,
        args: &[(&str, &str)],
        at: u64,
    ) -> Result<crate::runtime::Evaluation, FormulaError> {
        let registry = FormulaRegistry::with_defaults();
        let args: BTreeMap<String, String> = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        registry
            .evaluate(
                storage,
                block_env_at(storage, "test-1", at).await?,
                name,
                contract,
                &args,
            )
            .await
    }

    #[tokio::test]
    async fn cw4_voting_power_reads_member_weight() {
        let storage = MemoryStorage::new();
        seed_cw4(&storage).await;

        let eval = run(
            &storage,
            "voting_power",
            "dao-voting",
            &[("address", "juno1voter")],
            10,
        )
        .await
        .unwrap();
        assert_eq!(eval.output, serde_json::json!(7));

        // Dependencies transit into the group contract's keys.
        assert!(eval
            .dependencies
            .iter()
            .any(|d| matches!(d, Dependency::Point { contract, .. } if contract == "cw4-group")));
    }

    #[tokio::test]
    async fn cw4_voting_power_defaults_to_zero_for_non_member() {
        let storage = MemoryStorage::new();
        seed_cw4(&storage).await;

        let eval = run(
            &storage,
            "voting_power",
            "dao-voting",
            &[("address", "juno1stranger")],
            10,
        )
        .await
        .unwrap();
        assert_eq!(eval.output, serde_json::json!(0));
    }

    #[tokio::test]
    async fn cw4_total_power_reads_group_total() {
        let storage = MemoryStorage::new();
        seed_cw4(&storage).await;

        let eval = run(&storage, "total_power", "dao-voting", &[], 10).await.unwrap();
        assert_eq!(eval.output, serde_json::json!(10));
    }

    #[tokio::test]
    async fn unsupported_contract_family_errors() {
        let storage = MemoryStorage::new();
        let events = vec![event(
            "mystery",
            b"contract_info",
            5,
            r#"{"contract":"crates.io:something-else"}"#,
        )];
        storage.upsert_contracts(&events).await.unwrap();
        storage.upsert_events(&events).await.unwrap();

        let err = run(
            &storage,
            "voting_power",
            "mystery",
            &[("address", "juno1x")],
            10,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FormulaError::UnsupportedContract { .. }));
    }
}
