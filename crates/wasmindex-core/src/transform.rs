//! Transformation rules — normalized projections of raw key/value writes.
//!
//! A rule pattern-matches parsed events on contract code and key bytes and
//! projects a derived row per `(block, contract, name)`. Derived rows feed
//! the search layer and act as additional change-keys for cache
//! invalidation.

use std::collections::BTreeMap;

use crate::keys::{key_matches_prefix, key_to_comma, namespace_prefix, split_segments};
use crate::types::{Transformation, WasmEvent};

/// How a rule matches the decoded key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// The key equals exactly these bytes.
    Exact(Vec<u8>),
    /// The key starts with these bytes (at byte granularity).
    Prefix(Vec<u8>),
}

impl KeyFilter {
    fn comma(&self) -> String {
        match self {
            Self::Exact(b) | Self::Prefix(b) => key_to_comma(b),
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(_) => key == self.comma(),
            Self::Prefix(_) => key_matches_prefix(key, &self.comma()),
        }
    }
}

/// What a rule produced for an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Value(serde_json::Value),
    /// The rule elected not to produce a row for this event.
    Skip,
}

/// What to do when the matched event is a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Write the row with a `null` value.
    PropagateNull,
    /// Produce nothing.
    Drop,
}

type NameFn = Box<dyn Fn(&WasmEvent) -> Option<String> + Send + Sync>;
type ProjectFn = Box<dyn Fn(&WasmEvent) -> Projection + Send + Sync>;

/// A single transformation rule.
pub struct TransformationRule {
    pub id: &'static str,
    /// Restrict to contracts with one of these code ids (empty = any).
    pub code_ids: Vec<u64>,
    pub key_filter: KeyFilter,
    pub on_delete: DeletePolicy,
    name_fn: NameFn,
    project_fn: ProjectFn,
}

impl TransformationRule {
    pub fn new(
        id: &'static str,
        key_filter: KeyFilter,
        name_fn: impl Fn(&WasmEvent) -> Option<String> + Send + Sync + 'static,
        project_fn: impl Fn(&WasmEvent) -> Projection + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            code_ids: Vec::new(),
            key_filter,
            on_delete: DeletePolicy::PropagateNull,
            name_fn: Box::new(name_fn),
            project_fn: Box::new(project_fn),
        }
    }

    pub fn with_code_ids(mut self, code_ids: Vec<u64>) -> Self {
        self.code_ids = code_ids;
        self
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.on_delete = policy;
        self
    }

    pub fn matches(&self, event: &WasmEvent) -> bool {
        (self.code_ids.is_empty() || self.code_ids.contains(&event.code_id))
            && self.key_filter.matches(&event.key)
    }

    /// Apply the rule to a matching event.
    pub fn apply(&self, event: &WasmEvent) -> Option<Transformation> {
        let name = (self.name_fn)(event)?;

        let value = if event.deleted {
            match self.on_delete {
                DeletePolicy::PropagateNull => serde_json::Value::Null,
                DeletePolicy::Drop => return None,
            }
        } else {
            match (self.project_fn)(event) {
                Projection::Value(v) => v,
                Projection::Skip => return None,
            }
        };

        Some(Transformation {
            block_height: event.block_height,
            contract_address: event.contract_address.clone(),
            name,
            value,
        })
    }
}

impl std::fmt::Debug for TransformationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationRule")
            .field("id", &self.id)
            .field("code_ids", &self.code_ids)
            .field("key_filter", &self.key_filter)
            .finish()
    }
}

/// Applies every registered rule to a parsed batch.
#[derive(Debug, Default)]
pub struct TransformerRegistry {
    rules: Vec<TransformationRule>,
}

impl TransformerRegistry {
    pub fn new(rules: Vec<TransformationRule>) -> Self {
        Self { rules }
    }

    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    pub fn add(&mut self, rule: TransformationRule) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run all rules over a batch, keeping the last projection per
    /// `(block, contract, name)`.
    pub fn apply_batch(&self, events: &[WasmEvent]) -> Vec<Transformation> {
        let mut rows: BTreeMap<(u64, String, String), Transformation> = BTreeMap::new();
        for event in events {
            for rule in &self.rules {
                if !rule.matches(event) {
                    continue;
                }
                if let Some(t) = rule.apply(event) {
                    rows.insert(
                        (t.block_height, t.contract_address.clone(), t.name.clone()),
                        t,
                    );
                }
            }
        }
        rows.into_values().collect()
    }
}

/// The stock rule set: a map projection embedding the holder address in the
/// row name, and a passthrough for the singleton config item.
pub fn default_rules() -> Vec<TransformationRule> {
    vec![
        TransformationRule::new(
            "balance",
            KeyFilter::Prefix(namespace_prefix(&[b"balance"])),
            |event| {
                let bytes = crate::keys::comma_to_key(&event.key).ok()?;
                let segments = split_segments(&bytes, 2)?;
                let addr = String::from_utf8(segments[1].clone()).ok()?;
                Some(format!("balance:{addr}"))
            },
            |event| match event.read_value() {
                Some(v) => Projection::Value(v),
                None => Projection::Skip,
            },
        ),
        TransformationRule::new(
            "config",
            KeyFilter::Exact(b"config".to_vec()),
            |_| Some("config".to_string()),
            |event| match event.read_value() {
                Some(v) => Projection::Value(v),
                None => Projection::Skip,
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_to_comma;

    fn event(contract: &str, key_bytes: &[u8], value: &str, height: u64) -> WasmEvent {
        WasmEvent {
            block_height: height,
            block_time_unix_ms: height * 1000,
            contract_address: contract.into(),
            code_id: 1,
            key: key_to_comma(key_bytes),
            value: Some(value.into()),
            value_json: serde_json::from_str(value).ok(),
            deleted: false,
        }
    }

    fn balance_key(addr: &str) -> Vec<u8> {
        let mut k = namespace_prefix(&[b"balance"]);
        k.extend_from_slice(addr.as_bytes());
        k
    }

    #[test]
    fn balance_rule_embeds_address_in_name() {
        let registry = TransformerRegistry::with_default_rules();
        let rows = registry.apply_batch(&[event("c1", &balance_key("juno1aaa"), "\"10\"", 5)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "balance:juno1aaa");
        assert_eq!(rows[0].value, serde_json::json!("10"));
    }

    #[test]
    fn config_rule_requires_exact_key() {
        let registry = TransformerRegistry::with_default_rules();
        let rows = registry.apply_batch(&[
            event("c1", b"config", r#"{"owner":"juno1x"}"#, 5),
            event("c1", b"config2", r#"{"owner":"juno1y"}"#, 5),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "config");
    }

    #[test]
    fn last_projection_wins_within_batch() {
        let registry = TransformerRegistry::with_default_rules();
        let rows = registry.apply_batch(&[
            event("c1", &balance_key("juno1aaa"), "\"10\"", 5),
            event("c1", &balance_key("juno1aaa"), "\"20\"", 5),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, serde_json::json!("20"));
    }

    #[test]
    fn delete_propagates_null_by_default() {
        let registry = TransformerRegistry::with_default_rules();
        let mut e = event("c1", &balance_key("juno1aaa"), "\"10\"", 5);
        e.deleted = true;
        e.value = None;
        e.value_json = None;
        let rows = registry.apply_batch(&[e]);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].value.is_null());
    }

    #[test]
    fn drop_policy_suppresses_delete_rows() {
        let rule = TransformationRule::new(
            "cfg",
            KeyFilter::Exact(b"config".to_vec()),
            |_| Some("config".into()),
            |e| match e.read_value() {
                Some(v) => Projection::Value(v),
                None => Projection::Skip,
            },
        )
        .with_delete_policy(DeletePolicy::Drop);

        let mut e = event("c1", b"config", "{}", 5);
        e.deleted = true;
        let registry = TransformerRegistry::new(vec![rule]);
        assert!(registry.apply_batch(&[e]).is_empty());
    }

    #[test]
    fn code_id_filter_limits_rule() {
        let rule = TransformationRule::new(
            "cfg",
            KeyFilter::Exact(b"config".to_vec()),
            |_| Some("config".into()),
            |_| Projection::Value(serde_json::json!(1)),
        )
        .with_code_ids(vec![99]);
        let registry = TransformerRegistry::new(vec![rule]);
        assert!(registry.apply_batch(&[event("c1", b"config", "{}", 5)]).is_empty());
    }
}
