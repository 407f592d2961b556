//! Counter CRDT.
//!
//! Each actor accumulates into its own slot and carries its own version
//! counter. The caller-facing value is the sum over all actors.
//!
//! ```
//! use strata_crdt::{CountOperation, CrdtCount, CrdtModel, VersionRange};
//!
//! let mut count = CrdtCount::new();
//! let op = CountOperation::MultiIncrement {
//!     actor: "me".into(),
//!     version: VersionRange::new(0, 1),
//!     value: 7,
//! };
//! assert!(count.apply_operation(&op).unwrap());
//! assert_eq!(count.particle_view(), 7);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_types::Actor;
use tracing::debug;

use crate::error::{check_actor, CrdtError, CrdtResult};
use crate::model::{CrdtChange, CrdtData, CrdtModel, MergeChanges};
use crate::version::VersionMap;

/// State of a [`CrdtCount`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountData {
    /// Accumulated value per actor.
    pub values: BTreeMap<Actor, u64>,
    /// Version counter per actor.
    pub version_map: VersionMap,
}

impl CrdtData for CountData {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

/// Version transition carried by a counter operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub from: u64,
    pub to: u64,
}

impl VersionRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }
}

/// Operations on a [`CrdtCount`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountOperation {
    /// Add one to `actor`'s slot.
    Increment { actor: Actor, version: VersionRange },
    /// Add `value` to `actor`'s slot.
    MultiIncrement {
        actor: Actor,
        version: VersionRange,
        value: u64,
    },
}

impl CountOperation {
    pub fn actor(&self) -> &Actor {
        match self {
            Self::Increment { actor, .. } | Self::MultiIncrement { actor, .. } => actor,
        }
    }

    pub fn version(&self) -> VersionRange {
        match self {
            Self::Increment { version, .. } | Self::MultiIncrement { version, .. } => *version,
        }
    }

    fn delta(&self) -> u64 {
        match self {
            Self::Increment { .. } => 1,
            Self::MultiIncrement { value, .. } => *value,
        }
    }
}

/// Per-actor accumulating counter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrdtCount {
    data: CountData,
}

impl CrdtCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: CountData) -> Self {
        Self { data }
    }
}

impl CrdtModel for CrdtCount {
    type Data = CountData;
    type Operation = CountOperation;
    type View = u64;

    fn merge(&mut self, other: &CountData) -> CrdtResult<MergeChanges<CountData, CountOperation>> {
        let mut merged = self.data.clone();
        let mut model_ops = Vec::new();
        let mut other_ops = Vec::new();

        for (actor, &other_value) in &other.values {
            let this_value = self.data.values.get(actor).copied().unwrap_or(0);
            let this_version = self.data.version_map.get(actor.as_str());
            let other_version = other.version_map.get(actor.as_str());
            let divergent = || CrdtError::DivergentVersions {
                actor: actor.clone(),
                local_value: this_value,
                local_version: this_version,
                remote_value: other_value,
                remote_version: other_version,
            };

            if this_value > other_value {
                if other_version >= this_version {
                    return Err(divergent());
                }
                other_ops.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    version: VersionRange::new(other_version, this_version),
                    value: this_value - other_value,
                });
            } else if other_value > this_value {
                if this_version >= other_version {
                    return Err(divergent());
                }
                model_ops.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    version: VersionRange::new(this_version, other_version),
                    value: other_value - this_value,
                });
                merged.values.insert(actor.clone(), other_value);
                merged.version_map.set(actor.clone(), other_version);
            }
        }

        for (actor, &this_value) in &self.data.values {
            if other.values.contains_key(actor) {
                continue;
            }
            if other.version_map.get(actor.as_str()) != 0 {
                return Err(CrdtError::VersionWithoutValue(actor.clone()));
            }
            other_ops.push(CountOperation::MultiIncrement {
                actor: actor.clone(),
                version: VersionRange::new(0, self.data.version_map.get(actor.as_str())),
                value: this_value,
            });
        }

        debug!(
            local_ops = model_ops.len(),
            remote_ops = other_ops.len(),
            "merged counter"
        );
        self.data = merged;
        Ok(MergeChanges {
            model_change: CrdtChange::Operations(model_ops),
            other_change: CrdtChange::Operations(other_ops),
        })
    }

    fn apply_operation(&mut self, op: &CountOperation) -> CrdtResult<bool> {
        let actor = op.actor();
        check_actor(actor)?;
        let version = op.version();
        if version.to <= version.from {
            return Ok(false);
        }
        if self.data.version_map.get(actor.as_str()) != version.from {
            debug!(%actor, from = version.from, "rejected out-of-order counter increment");
            return Ok(false);
        }
        *self.data.values.entry(actor.clone()).or_insert(0) += op.delta();
        self.data.version_map.set(actor.clone(), version.to);
        Ok(true)
    }

    fn data(&self) -> CountData {
        self.data.clone()
    }

    fn particle_view(&self) -> u64 {
        self.data.values.values().sum()
    }

    fn update_data(&mut self, data: CountData) {
        self.data = data;
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi(actor: &str, value: u64, from: u64, to: u64) -> CountOperation {
        CountOperation::MultiIncrement {
            actor: actor.into(),
            version: VersionRange::new(from, to),
            value,
        }
    }

    fn inc(actor: &str, from: u64, to: u64) -> CountOperation {
        CountOperation::Increment {
            actor: actor.into(),
            version: VersionRange::new(from, to),
        }
    }

    #[test]
    fn starts_at_zero() {
        assert_eq!(CrdtCount::new().particle_view(), 0);
    }

    #[test]
    fn increments_accumulate_per_actor() {
        let mut count = CrdtCount::new();
        assert!(count.apply_operation(&inc("me", 0, 1)).unwrap());
        assert!(count.apply_operation(&inc("me", 1, 2)).unwrap());
        assert!(count.apply_operation(&multi("them", 5, 0, 1)).unwrap());
        assert_eq!(count.particle_view(), 7);
        assert_eq!(count.version_map(), VersionMap::from([("me", 2), ("them", 1)]));
    }

    #[test]
    fn rejects_gaps_and_replays() {
        let mut count = CrdtCount::new();
        assert!(!count.apply_operation(&inc("me", 1, 2)).unwrap());
        assert!(count.apply_operation(&inc("me", 0, 1)).unwrap());
        assert!(!count.apply_operation(&inc("me", 0, 1)).unwrap());
        assert_eq!(count.particle_view(), 1);
    }

    #[test]
    fn increment_without_actor_is_an_error() {
        let mut count = CrdtCount::new();
        assert_eq!(count.apply_operation(&inc("", 0, 1)), Err(CrdtError::EmptyActor));
        assert_eq!(count.apply_operation(&multi("", 3, 0, 1)), Err(CrdtError::EmptyActor));
        assert_eq!(count.data(), CountData::default());
    }

    #[test]
    fn rejects_non_advancing_version() {
        let mut count = CrdtCount::new();
        assert!(!count.apply_operation(&inc("me", 0, 0)).unwrap());
        assert_eq!(count.data(), CountData::default());
    }

    #[test]
    fn merge_exchanges_missing_increments() {
        let mut count1 = CrdtCount::new();
        assert!(count1.apply_operation(&multi("me", 7, 0, 1)).unwrap());
        assert_eq!(count1.particle_view(), 7);

        let mut count2 = CrdtCount::new();
        assert!(count2.apply_operation(&multi("them", 4, 0, 1)).unwrap());

        let changes = count1.merge(&count2.data()).unwrap();
        assert_eq!(count1.particle_view(), 11);
        assert_eq!(
            changes.model_change,
            CrdtChange::Operations(vec![multi("them", 4, 0, 1)])
        );
        assert_eq!(
            changes.other_change,
            CrdtChange::Operations(vec![multi("me", 7, 0, 1)])
        );

        for op in changes.other_change.operations().unwrap() {
            assert!(count2.apply_operation(op).unwrap());
        }
        assert_eq!(count2.data(), count1.data());
    }

    #[test]
    fn merge_catches_up_partial_progress() {
        let mut ahead = CrdtCount::new();
        ahead.apply_operation(&inc("me", 0, 1)).unwrap();
        let behind = ahead.data();
        ahead.apply_operation(&multi("me", 3, 1, 2)).unwrap();

        let mut behind = CrdtCount::with_data(behind);
        let changes = behind.merge(&ahead.data()).unwrap();
        assert_eq!(
            changes.model_change,
            CrdtChange::Operations(vec![multi("me", 3, 1, 2)])
        );
        assert!(changes.other_change.is_empty());
        assert_eq!(behind.data(), ahead.data());
    }

    #[test]
    fn merge_with_self_is_empty() {
        let mut count = CrdtCount::new();
        count.apply_operation(&multi("me", 2, 0, 1)).unwrap();
        let changes = count.merge(&count.data()).unwrap();
        assert!(changes.model_change.is_empty());
        assert!(changes.other_change.is_empty());
    }

    #[test]
    fn different_values_at_same_version_are_divergent() {
        let mut a = CrdtCount::new();
        a.apply_operation(&multi("me", 2, 0, 1)).unwrap();
        let mut b = CrdtCount::new();
        b.apply_operation(&multi("me", 3, 0, 1)).unwrap();

        let before = a.data();
        let err = a.merge(&b.data()).unwrap_err();
        assert!(matches!(err, CrdtError::DivergentVersions { .. }));
        assert_eq!(a.data(), before);
    }

    #[test]
    fn version_without_value_is_an_error() {
        let mut a = CrdtCount::new();
        a.apply_operation(&multi("me", 2, 0, 1)).unwrap();
        let corrupt = CountData {
            values: BTreeMap::new(),
            version_map: VersionMap::from([("me", 1)]),
        };
        assert_eq!(
            a.merge(&corrupt).unwrap_err(),
            CrdtError::VersionWithoutValue("me".into())
        );
    }
}
