use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CrdtResult;
use crate::version::VersionMap;

/// Serializable state of a CRDT model.
pub trait CrdtData: Clone + fmt::Debug + PartialEq {
    /// The aggregate clock of the model.
    fn version_map(&self) -> &VersionMap;
}

/// A change to a model: either a list of operations to replay, or a full
/// post-change snapshot when the change cannot be expressed as operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdtChange<D, O> {
    Operations(Vec<O>),
    Data(D),
}

impl<D, O> CrdtChange<D, O> {
    /// A change that does nothing.
    pub fn empty() -> Self {
        Self::Operations(Vec::new())
    }

    /// `true` for an empty operation list.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Operations(ops) if ops.is_empty())
    }

    /// The operations, if this change is expressed as operations.
    pub fn operations(&self) -> Option<&[O]> {
        match self {
            Self::Operations(ops) => Some(ops),
            Self::Data(_) => None,
        }
    }
}

/// The result of a merge: what changed locally, and what the other replica
/// must apply to reach the merged state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeChanges<D, O> {
    pub model_change: CrdtChange<D, O>,
    pub other_change: CrdtChange<D, O>,
}

impl<D, O> MergeChanges<D, O> {
    /// No change on either side.
    pub fn empty() -> Self {
        Self {
            model_change: CrdtChange::empty(),
            other_change: CrdtChange::empty(),
        }
    }
}

/// Contract shared by every CRDT kind.
///
/// The associated types tie a model to its snapshot, operation, and
/// caller-facing view types. Implementations are synchronous and are not
/// internally synchronized.
pub trait CrdtModel {
    type Data: CrdtData;
    type Operation: Clone + fmt::Debug;
    type View;

    /// Merge `other` into this model, returning the changes for both sides.
    fn merge(
        &mut self,
        other: &Self::Data,
    ) -> CrdtResult<MergeChanges<Self::Data, Self::Operation>>;

    /// Apply a single operation.
    ///
    /// Returns `Ok(false)` when the operation is out of order or does not
    /// dominate what it replaces; the model is left unchanged.
    fn apply_operation(&mut self, op: &Self::Operation) -> CrdtResult<bool>;

    /// A copy of the model state.
    fn data(&self) -> Self::Data;

    /// The reduced value handed to callers.
    fn particle_view(&self) -> Self::View;

    /// Replace the model state wholesale.
    fn update_data(&mut self, data: Self::Data);

    /// A copy of the model's aggregate clock.
    fn version_map(&self) -> VersionMap;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_change_is_empty() {
        let change: CrdtChange<(), u8> = CrdtChange::empty();
        assert!(change.is_empty());
        assert_eq!(change.operations(), Some(&[][..]));
    }

    #[test]
    fn data_change_is_not_empty() {
        let change: CrdtChange<u8, u8> = CrdtChange::Data(1);
        assert!(!change.is_empty());
        assert!(change.operations().is_none());
    }
}
