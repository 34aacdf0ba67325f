//! Desired-state index
//!
//! The set of resource identities the current builder list claims. A
//! disabled builder still claims its identity: its resource is removed
//! through the engine's delete path, never by pruning.

use std::collections::{BTreeSet, HashMap};

use kube::core::GroupVersionKind;

use keel_common::Result;

use crate::builder::ResourceBuilder;
use crate::resource::ResourceKey;

/// GVK -> set of "{namespace}.{name}"
#[derive(Debug, Clone, Default)]
pub struct DesiredStateIndex {
    entries: HashMap<GroupVersionKind, BTreeSet<String>>,
}

impl DesiredStateIndex {
    /// An empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every builder's identity, enabled or not
    pub fn from_builders(builders: &[Box<dyn ResourceBuilder>]) -> Result<Self> {
        let mut index = Self::new();
        for builder in builders {
            index.add(&ResourceKey::of(&builder.build()?)?);
        }
        Ok(index)
    }

    /// Record an identity as desired
    pub fn add(&mut self, key: &ResourceKey) {
        self.entries
            .entry(key.gvk.clone())
            .or_default()
            .insert(key.index_key());
    }

    /// Whether an identity is desired
    pub fn has(&self, key: &ResourceKey) -> bool {
        self.entries
            .get(&key.gvk)
            .is_some_and(|names| names.contains(&key.index_key()))
    }

    /// Number of desired identities
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// Whether no identity is desired
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
