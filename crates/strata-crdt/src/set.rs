//! Observed-remove set CRDT.
//!
//! Based on the optimized OR-Set of Bieniusa et al., "An Optimized
//! Conflict-free Replicated Set" (2012). Every entry records the version at
//! which it was (re-)added. A remove is only accepted when its clock
//! dominates that version, i.e. when the remover has observed every
//! concurrent add. Removed entries are deleted outright; there are no
//! tombstones.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_types::{Actor, Referencable, ReferenceId};
use tracing::debug;

use crate::error::{check_actor, CrdtError, CrdtResult};
use crate::model::{CrdtChange, CrdtData, CrdtModel, MergeChanges};
use crate::version::VersionMap;

/// A value held by a set, with the version at which it was last touched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataValue<T> {
    pub value: T,
    pub version_map: VersionMap,
}

impl<T> DataValue<T> {
    pub fn new(value: T, version_map: VersionMap) -> Self {
        Self { value, version_map }
    }
}

/// State of a [`CrdtSet`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetData<T> {
    pub version_map: VersionMap,
    pub values: BTreeMap<ReferenceId, DataValue<T>>,
}

impl<T> Default for SetData<T> {
    fn default() -> Self {
        Self {
            version_map: VersionMap::new(),
            values: BTreeMap::new(),
        }
    }
}

impl<T> SetData<T> {
    pub fn new(version_map: VersionMap, values: BTreeMap<ReferenceId, DataValue<T>>) -> Self {
        Self {
            version_map,
            values,
        }
    }

    fn same_ids(&self, other: &SetData<T>) -> bool {
        self.values.len() == other.values.len()
            && self.values.keys().all(|id| other.values.contains_key(id))
    }
}

impl<T: Clone + fmt::Debug + PartialEq> CrdtData for SetData<T> {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

/// Batch catch-up produced by a merge.
///
/// Represents a merge result that cannot necessarily be replayed as discrete
/// operations: the receiver must be at least at `old_clock`, and ends at
/// (at least) `new_clock`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastForwardOp<T> {
    pub old_clock: VersionMap,
    pub new_clock: VersionMap,
    pub added: Vec<DataValue<T>>,
    pub removed: Vec<T>,
}

impl<T: Referencable + Clone> FastForwardOp<T> {
    pub fn new(old_clock: VersionMap, new_clock: VersionMap) -> Self {
        Self {
            old_clock,
            new_clock,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// `true` if applying this op changes nothing.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.old_clock == self.new_clock
    }

    /// Rewrite this op as plain adds, if possible.
    ///
    /// Only additions made by a single actor whose versions form a contiguous
    /// `+1` run from `old_clock` can be replayed in order. Anything else stays
    /// a single fast-forward; a no-op becomes an empty list.
    pub fn simplify(self) -> Vec<SetOperation<T>> {
        if !self.removed.is_empty() {
            return vec![SetOperation::FastForward(self)];
        }
        if self.added.is_empty() {
            if self.old_clock == self.new_clock {
                return Vec::new();
            }
            return vec![SetOperation::FastForward(self)];
        }

        let advanced: Vec<Actor> = self
            .new_clock
            .advanced_since(&self.old_clock)
            .cloned()
            .collect();
        let [actor] = advanced.as_slice() else {
            return vec![SetOperation::FastForward(self)];
        };
        let actor = actor.clone();

        let mut order: Vec<usize> = (0..self.added.len()).collect();
        order.sort_by_key(|&i| self.added[i].version_map.get(actor.as_str()));

        let mut expected = self.old_clock.get(actor.as_str());
        for &i in &order {
            expected += 1;
            if self.added[i].version_map.get(actor.as_str()) != expected {
                return vec![SetOperation::FastForward(self)];
            }
        }
        let mut expected_clock = self.old_clock.clone();
        expected_clock.set(actor.clone(), expected);
        if expected_clock != self.new_clock {
            return vec![SetOperation::FastForward(self)];
        }

        let mut slots: Vec<Option<DataValue<T>>> = self.added.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .map(|entry| SetOperation::Add {
                actor: actor.clone(),
                clock: entry.version_map,
                added: entry.value,
            })
            .collect()
    }
}

/// Operations on a [`CrdtSet`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOperation<T> {
    /// Add (or re-add) a value. `clock[actor]` must be exactly one past the
    /// model's counter for `actor`.
    Add {
        actor: Actor,
        clock: VersionMap,
        added: T,
    },
    /// Remove a value. Does not advance `actor`'s counter; `clock` must
    /// dominate the entry's recorded version.
    Remove {
        actor: Actor,
        clock: VersionMap,
        removed: T,
    },
    /// Remove every value whose recorded version `clock` dominates.
    Clear { actor: Actor, clock: VersionMap },
    FastForward(FastForwardOp<T>),
}

impl<T> SetOperation<T> {
    /// The clock the operation was issued at.
    pub fn clock(&self) -> &VersionMap {
        match self {
            Self::Add { clock, .. } | Self::Remove { clock, .. } | Self::Clear { clock, .. } => {
                clock
            }
            Self::FastForward(op) => &op.new_clock,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Clear { .. } => "clear",
            Self::FastForward(_) => "fast-forward",
        }
    }
}

/// Observed-remove set of [`Referencable`] values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdtSet<T> {
    data: SetData<T>,
}

impl<T> Default for CrdtSet<T> {
    fn default() -> Self {
        Self {
            data: SetData::default(),
        }
    }
}

impl<T> CrdtSet<T>
where
    T: Referencable + Clone + fmt::Debug + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: SetData<T>) -> Self {
        Self { data }
    }

    /// Borrow the current state without copying.
    pub fn data_ref(&self) -> &SetData<T> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.values.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.values.contains_key(id)
    }

    /// Whether `op` would be accepted, without applying it.
    pub fn can_apply_operation(&self, op: &SetOperation<T>) -> CrdtResult<bool> {
        match op {
            SetOperation::Add { actor, clock, added } => self.check_add(actor, clock, added),
            SetOperation::Remove {
                actor,
                clock,
                removed,
            } => self.check_remove(actor, clock, removed),
            SetOperation::Clear { actor, clock } => self.check_clear(actor, clock),
            SetOperation::FastForward(op) => self.check_fast_forward(op),
        }
    }

    fn check_add(&self, actor: &Actor, clock: &VersionMap, value: &T) -> CrdtResult<bool> {
        check_actor(actor)?;
        check_id(value)?;
        Ok(clock.get(actor.as_str()) == self.data.version_map.get(actor.as_str()) + 1)
    }

    fn check_remove(&self, actor: &Actor, clock: &VersionMap, value: &T) -> CrdtResult<bool> {
        check_actor(actor)?;
        check_id(value)?;
        let Some(existing) = self.data.values.get(value.id()) else {
            return Ok(false);
        };
        if clock.get(actor.as_str()) != self.data.version_map.get(actor.as_str()) {
            return Ok(false);
        }
        Ok(clock.dominates(&existing.version_map))
    }

    fn check_clear(&self, actor: &Actor, clock: &VersionMap) -> CrdtResult<bool> {
        check_actor(actor)?;
        Ok(clock.get(actor.as_str()) == self.data.version_map.get(actor.as_str()))
    }

    fn check_fast_forward(&self, op: &FastForwardOp<T>) -> CrdtResult<bool> {
        for entry in &op.added {
            check_id(&entry.value)?;
        }
        for value in &op.removed {
            check_id(value)?;
        }
        Ok(self.data.version_map.dominates(&op.old_clock))
    }

    fn add(&mut self, actor: &Actor, clock: &VersionMap, value: &T) -> CrdtResult<bool> {
        if !self.check_add(actor, clock, value)? {
            debug!(%actor, %clock, id = value.id(), "rejected out-of-order add");
            return Ok(false);
        }
        self.data
            .version_map
            .set(actor.clone(), clock.get(actor.as_str()));
        let version_map = match self.data.values.get(value.id()) {
            Some(previous) => clock.merge_with(&previous.version_map),
            None => clock.clone(),
        };
        self.data.values.insert(
            value.id().to_string(),
            DataValue::new(value.clone(), version_map),
        );
        Ok(true)
    }

    fn remove(&mut self, actor: &Actor, clock: &VersionMap, value: &T) -> CrdtResult<bool> {
        if !self.check_remove(actor, clock, value)? {
            debug!(%actor, %clock, id = value.id(), "rejected remove");
            return Ok(false);
        }
        self.data.values.remove(value.id());
        Ok(true)
    }

    fn clear(&mut self, actor: &Actor, clock: &VersionMap) -> CrdtResult<bool> {
        if !self.check_clear(actor, clock)? {
            debug!(%actor, %clock, "rejected clear");
            return Ok(false);
        }
        self.data
            .values
            .retain(|_, entry| clock.does_not_dominate(&entry.version_map));
        Ok(true)
    }

    fn fast_forward(&mut self, op: &FastForwardOp<T>) -> CrdtResult<bool> {
        if !self.check_fast_forward(op)? {
            debug!(old = %op.old_clock, current = %self.data.version_map, "rejected fast-forward");
            return Ok(false);
        }
        if self.data.version_map.dominates(&op.new_clock) {
            // Removes never advance a clock, so a replica already at
            // `new_clock` may still hold the removed values.
            self.remove_dominated(op);
            return Ok(true);
        }

        let current = self.data.version_map.clone();
        for entry in &op.added {
            let id = entry.value.id();
            if let Some(existing) = self.data.values.get_mut(id) {
                existing.version_map = existing.version_map.merge_with(&entry.version_map);
            } else if current.does_not_dominate(&entry.version_map) {
                self.data.values.insert(id.to_string(), entry.clone());
            }
        }
        self.remove_dominated(op);
        self.data.version_map.merge_in_place(&op.new_clock);
        Ok(true)
    }

    fn remove_dominated(&mut self, op: &FastForwardOp<T>) {
        for value in &op.removed {
            let id = value.id();
            let dominated = self
                .data
                .values
                .get(id)
                .is_some_and(|existing| op.new_clock.dominates(&existing.version_map));
            if dominated {
                self.data.values.remove(id);
            }
        }
    }

    /// Merge `other` into this set, returning the local change and the raw
    /// fast-forward the other side needs (`None` when both sides already
    /// agree).
    pub(crate) fn merge_raw(
        &mut self,
        other: &SetData<T>,
    ) -> (CrdtChange<SetData<T>, SetOperation<T>>, Option<FastForwardOp<T>>) {
        if self.data.version_map == other.version_map && self.data.same_ids(other) {
            return (CrdtChange::empty(), None);
        }

        let new_clock = self.data.version_map.merge_with(&other.version_map);
        let mut merged: BTreeMap<ReferenceId, DataValue<T>> = BTreeMap::new();
        let mut fast_forward = FastForwardOp::new(other.version_map.clone(), new_clock.clone());

        for (id, other_entry) in &other.values {
            match self.data.values.get(id) {
                Some(mine) if mine.version_map == other_entry.version_map => {
                    merged.insert(id.clone(), mine.clone());
                }
                Some(mine) => {
                    let entry = DataValue::new(
                        other_entry.value.clone(),
                        mine.version_map.merge_with(&other_entry.version_map),
                    );
                    fast_forward.added.push(entry.clone());
                    merged.insert(id.clone(), entry);
                }
                None if self.data.version_map.dominates(&other_entry.version_map) => {
                    fast_forward.removed.push(other_entry.value.clone());
                }
                None => {
                    merged.insert(id.clone(), other_entry.clone());
                }
            }
        }
        for (id, mine) in &self.data.values {
            if !other.values.contains_key(id)
                && other.version_map.does_not_dominate(&mine.version_map)
            {
                merged.insert(id.clone(), mine.clone());
                fast_forward.added.push(mine.clone());
            }
        }

        let merged = SetData::new(new_clock, merged);
        let model_change = if merged == self.data {
            CrdtChange::empty()
        } else {
            CrdtChange::Data(merged.clone())
        };
        debug!(
            added = fast_forward.added.len(),
            removed = fast_forward.removed.len(),
            version = %merged.version_map,
            "merged set"
        );
        self.data = merged;
        (model_change, Some(fast_forward))
    }
}

fn check_id<T: Referencable>(value: &T) -> CrdtResult<()> {
    if value.id().is_empty() {
        return Err(CrdtError::MissingId);
    }
    Ok(())
}

impl<T> CrdtModel for CrdtSet<T>
where
    T: Referencable + Clone + fmt::Debug + PartialEq,
{
    type Data = SetData<T>;
    type Operation = SetOperation<T>;
    /// Values ordered by id.
    type View = Vec<T>;

    fn merge(
        &mut self,
        other: &SetData<T>,
    ) -> CrdtResult<MergeChanges<SetData<T>, SetOperation<T>>> {
        let (model_change, fast_forward) = self.merge_raw(other);
        let other_ops = fast_forward.map(FastForwardOp::simplify).unwrap_or_default();
        Ok(MergeChanges {
            model_change,
            other_change: CrdtChange::Operations(other_ops),
        })
    }

    fn apply_operation(&mut self, op: &SetOperation<T>) -> CrdtResult<bool> {
        match op {
            SetOperation::Add { actor, clock, added } => self.add(actor, clock, added),
            SetOperation::Remove {
                actor,
                clock,
                removed,
            } => self.remove(actor, clock, removed),
            SetOperation::Clear { actor, clock } => self.clear(actor, clock),
            SetOperation::FastForward(op) => self.fast_forward(op),
        }
    }

    fn data(&self) -> SetData<T> {
        self.data.clone()
    }

    fn particle_view(&self) -> Vec<T> {
        self.data
            .values
            .values()
            .map(|entry| entry.value.clone())
            .collect()
    }

    fn update_data(&mut self, data: SetData<T>) {
        self.data = data;
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }
}
