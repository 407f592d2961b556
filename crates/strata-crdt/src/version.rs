use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_types::Actor;

/// Version vector: actor to counter. An absent actor reads as `0`.
///
/// Version maps are only partially ordered, through [`VersionMap::dominates`].
/// Equality compares key sets as well as counters, so `{A: 0}` and `{}` are
/// not equal even though each dominates the other.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMap(BTreeMap<Actor, u64>);

impl VersionMap {
    /// An empty version map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Counter for `actor`, `0` if absent.
    pub fn get(&self, actor: &str) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Set the counter for `actor`.
    pub fn set(&mut self, actor: impl Into<Actor>, version: u64) {
        self.0.insert(actor.into(), version);
    }

    /// Increment the counter for `actor`, returning the new value.
    pub fn increment(&mut self, actor: impl Into<Actor>) -> u64 {
        let entry = self.0.entry(actor.into()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// A copy of this map with `actor` advanced by one.
    pub fn incremented(&self, actor: impl Into<Actor>) -> Self {
        let mut next = self.clone();
        next.increment(actor);
        next
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Actors present in this map, in lexicographic order.
    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.0.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Actor, u64> {
        self.0.iter()
    }

    /// Pointwise maximum of the two maps.
    pub fn merge_with(&self, other: &VersionMap) -> VersionMap {
        let mut merged = self.clone();
        merged.merge_in_place(other);
        merged
    }

    /// Raise every counter to at least the value in `other`.
    pub fn merge_in_place(&mut self, other: &VersionMap) {
        for (actor, &version) in &other.0 {
            let entry = self.0.entry(actor.clone()).or_insert(version);
            *entry = (*entry).max(version);
        }
    }

    /// `true` if every counter in `other` is at most the counter here.
    pub fn dominates(&self, other: &VersionMap) -> bool {
        other
            .0
            .iter()
            .all(|(actor, &version)| self.get(actor.as_str()) >= version)
    }

    pub fn does_not_dominate(&self, other: &VersionMap) -> bool {
        !self.dominates(other)
    }

    /// Actors whose counter here is strictly greater than in `older`.
    pub fn advanced_since<'a>(&'a self, older: &'a VersionMap) -> impl Iterator<Item = &'a Actor> {
        self.0
            .iter()
            .filter(move |(actor, &version)| version > older.get(actor.as_str()))
            .map(|(actor, _)| actor)
    }
}

impl fmt::Debug for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version{self}")
    }
}

impl fmt::Display for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (actor, version)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{actor}: {version}")?;
        }
        f.write_str("}")
    }
}

impl<A: Into<Actor>, const N: usize> From<[(A, u64); N]> for VersionMap {
    fn from(entries: [(A, u64); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl<A: Into<Actor>> FromIterator<(A, u64)> for VersionMap {
    fn from_iter<I: IntoIterator<Item = (A, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(a, v)| (a.into(), v)).collect())
    }
}

impl<'a> IntoIterator for &'a VersionMap {
    type Item = (&'a Actor, &'a u64);
    type IntoIter = btree_map::Iter<'a, Actor, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
