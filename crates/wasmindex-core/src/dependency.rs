//! Value-dependency model for cached computations.
//!
//! Every read a formula performs is recorded as a dependency: a point read
//! records the full key, a range read records the key prefix. When new
//! events arrive, intersecting the change-set with these dependencies tells
//! the cache which computations to truncate or destroy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::keys::key_matches_prefix;
use crate::types::{Transformation, WasmEvent};

/// A single recorded read, in canonical comma-decimal key form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Dependency {
    /// An exact-key read.
    Point { contract: String, key: String },
    /// A range read over every key under a prefix.
    Prefix { contract: String, prefix: String },
}

impl Dependency {
    pub fn point(contract: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Point {
            contract: contract.into(),
            key: key.into(),
        }
    }

    pub fn prefix(contract: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::Prefix {
            contract: contract.into(),
            prefix: prefix.into(),
        }
    }

    pub fn contract(&self) -> &str {
        match self {
            Self::Point { contract, .. } | Self::Prefix { contract, .. } => contract,
        }
    }

    /// The stored key-or-prefix column value.
    pub fn key_or_prefix(&self) -> &str {
        match self {
            Self::Point { key, .. } => key,
            Self::Prefix { prefix, .. } => prefix,
        }
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self, Self::Prefix { .. })
    }

    /// Does a write to `(contract, key)` invalidate this dependency?
    pub fn matches(&self, contract: &str, key: &str) -> bool {
        match self {
            Self::Point { contract: c, key: k } => c == contract && k == key,
            Self::Prefix {
                contract: c,
                prefix,
            } => c == contract && key_matches_prefix(key, prefix),
        }
    }
}

/// A changed key produced by a flush, from either a raw event or a derived
/// transformation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub contract_address: String,
    pub key: String,
    pub block_height: u64,
}

impl Change {
    pub fn from_event(event: &WasmEvent) -> Self {
        Self {
            contract_address: event.contract_address.clone(),
            key: event.key.clone(),
            block_height: event.block_height,
        }
    }

    pub fn from_transformation(t: &Transformation) -> Self {
        Self {
            contract_address: t.contract_address.clone(),
            key: t.name.clone(),
            block_height: t.block_height,
        }
    }
}

/// Accumulated dependency set for one evaluation.
///
/// Nested formula calls share a single accumulator, so dependencies transit
/// call boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    entries: BTreeSet<Dependency>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, dep: Dependency) {
        self.entries.insert(dep);
    }

    pub fn extend(&mut self, other: DependencySet) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.iter()
    }

    /// Collapse to the minimal set: drop point reads already covered by a
    /// recorded prefix on the same contract.
    pub fn collapsed(&self) -> Vec<Dependency> {
        let prefixes: Vec<&Dependency> = self.entries.iter().filter(|d| d.is_prefix()).collect();
        self.entries
            .iter()
            .filter(|dep| match dep {
                Dependency::Prefix { .. } => true,
                Dependency::Point { contract, key } => !prefixes
                    .iter()
                    .any(|p| p.matches(contract, key)),
            })
            .cloned()
            .collect()
    }
}

impl FromIterator<Dependency> for DependencySet {
    fn from_iter<T: IntoIterator<Item = Dependency>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
