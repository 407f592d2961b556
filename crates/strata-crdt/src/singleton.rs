//! Single-value CRDT, layered on [`CrdtSet`].
//!
//! Concurrent writers may leave more than one value retained. The visible
//! value is then the one with the lexicographically smallest id, so every
//! replica picks the same winner regardless of arrival order.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_types::{Actor, Referencable};
use tracing::debug;

use crate::error::{check_actor, CrdtResult};
use crate::model::{CrdtChange, CrdtModel, MergeChanges};
use crate::set::{CrdtSet, FastForwardOp, SetData, SetOperation};
use crate::version::VersionMap;

/// State of a [`CrdtSingleton`]; identical in shape to a set.
pub type SingletonData<T> = SetData<T>;

/// Operations on a [`CrdtSingleton`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingletonOperation<T> {
    /// Replace the value. `clock[actor]` must be one past the model's counter.
    Update {
        actor: Actor,
        clock: VersionMap,
        value: T,
    },
    /// Remove every retained value `clock` dominates.
    Clear { actor: Actor, clock: VersionMap },
    FastForward(FastForwardOp<T>),
}

impl<T> SingletonOperation<T> {
    pub fn clock(&self) -> &VersionMap {
        match self {
            Self::Update { clock, .. } | Self::Clear { clock, .. } => clock,
            Self::FastForward(op) => &op.new_clock,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::Clear { .. } => "clear",
            Self::FastForward(_) => "fast-forward",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdtSingleton<T> {
    set: CrdtSet<T>,
}

impl<T> Default for CrdtSingleton<T> {
    fn default() -> Self {
        Self {
            set: CrdtSet::default(),
        }
    }
}

impl<T> CrdtSingleton<T>
where
    T: Referencable + Clone + fmt::Debug + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: SingletonData<T>) -> Self {
        Self {
            set: CrdtSet::with_data(data),
        }
    }

    pub fn data_ref(&self) -> &SingletonData<T> {
        self.set.data_ref()
    }

    /// Whether `op` would be accepted, without applying it.
    pub fn can_apply_operation(&self, op: &SingletonOperation<T>) -> CrdtResult<bool> {
        match op {
            SingletonOperation::Update {
                actor,
                clock,
                value,
            } => self.set.can_apply_operation(&SetOperation::Add {
                actor: actor.clone(),
                clock: clock.clone(),
                added: value.clone(),
            }),
            SingletonOperation::Clear { .. } => Ok(true),
            SingletonOperation::FastForward(op) => self
                .set
                .can_apply_operation(&SetOperation::FastForward(op.clone())),
        }
    }

    /// Remove every value this actor may remove at `clock`.
    ///
    /// Individual removals that are rejected are skipped, not fatal; the
    /// clear as a whole always succeeds.
    fn clear(&mut self, actor: &Actor, clock: &VersionMap) -> CrdtResult<()> {
        check_actor(actor)?;
        let retained: Vec<T> = self
            .set
            .data_ref()
            .values
            .values()
            .map(|entry| entry.value.clone())
            .collect();
        for value in retained {
            let id = value.id().to_string();
            let removed = self.set.apply_operation(&SetOperation::Remove {
                actor: actor.clone(),
                clock: clock.clone(),
                removed: value,
            })?;
            if !removed {
                debug!(%actor, %clock, %id, "singleton clear skipped value");
            }
        }
        Ok(())
    }

    fn update(&mut self, actor: &Actor, clock: &VersionMap, value: &T) -> CrdtResult<bool> {
        let add = SetOperation::Add {
            actor: actor.clone(),
            clock: clock.clone(),
            added: value.clone(),
        };
        if !self.set.can_apply_operation(&add)? {
            debug!(%actor, %clock, "rejected out-of-order singleton update");
            return Ok(false);
        }
        let mut clear_clock = clock.clone();
        clear_clock.set(actor.clone(), clock.get(actor.as_str()).saturating_sub(1));
        self.clear(actor, &clear_clock)?;
        self.set.apply_operation(&add)
    }
}

impl<T> CrdtModel for CrdtSingleton<T>
where
    T: Referencable + Clone + fmt::Debug + PartialEq,
{
    type Data = SingletonData<T>;
    type Operation = SingletonOperation<T>;
    type View = Option<T>;

    fn merge(
        &mut self,
        other: &SingletonData<T>,
    ) -> CrdtResult<MergeChanges<SingletonData<T>, SingletonOperation<T>>> {
        let (set_change, fast_forward) = self.set.merge_raw(other);
        let model_change = match set_change {
            CrdtChange::Data(data) => CrdtChange::Data(data),
            CrdtChange::Operations(_) => CrdtChange::empty(),
        };
        let other_ops = match fast_forward {
            Some(op) if !op.is_noop() => vec![SingletonOperation::FastForward(op)],
            _ => Vec::new(),
        };
        Ok(MergeChanges {
            model_change,
            other_change: CrdtChange::Operations(other_ops),
        })
    }

    fn apply_operation(&mut self, op: &SingletonOperation<T>) -> CrdtResult<bool> {
        match op {
            SingletonOperation::Update {
                actor,
                clock,
                value,
            } => self.update(actor, clock, value),
            SingletonOperation::Clear { actor, clock } => {
                self.clear(actor, clock)?;
                Ok(true)
            }
            SingletonOperation::FastForward(op) => self
                .set
                .apply_operation(&SetOperation::FastForward(op.clone())),
        }
    }

    fn data(&self) -> SingletonData<T> {
        self.set.data()
    }

    /// The retained value with the smallest id.
    fn particle_view(&self) -> Option<T> {
        self.set
            .data_ref()
            .values
            .values()
            .next()
            .map(|entry| entry.value.clone())
    }

    fn update_data(&mut self, data: SingletonData<T>) {
        self.set.update_data(data);
    }

    fn version_map(&self) -> VersionMap {
        self.set.version_map()
    }
}
