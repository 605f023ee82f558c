//! Explicit snapshots of external state touched by stateful step functions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Value;

/// Flat `name -> value` view of every piece of external state a stateful
/// condition or body reads or writes.
///
/// Keys are kept sorted so that two snapshots holding the same entries always
/// iterate in the same order, which keeps example-state specialization stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    entries: BTreeMap<String, Value>,
}

impl StateSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(name.into(), value)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Overwrite entries of `self` with every entry of `update`.
    ///
    /// Entries absent from `update` keep their current value.
    pub fn merge(&mut self, update: StateSnapshot) {
        self.entries.extend(update.entries);
    }

    /// Copy of the entries whose names also appear in `template`.
    #[must_use]
    pub fn restricted_to(&self, template: &StateSnapshot) -> StateSnapshot {
        self.entries
            .iter()
            .filter(|(name, _)| template.entries.contains_key(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for StateSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for StateSnapshot {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
