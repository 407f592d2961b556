use serde::{Deserialize, Serialize};
use strata_crdt::CrdtError;

use crate::data::{
    ContainerData, ContainerOp, HasKind, RefModeStoreData, RefModeStoreOp, StoreKind,
};
use crate::error::RefModeResult;

/// Identifier a store hands out to each registered proxy.
pub type ProxyId = u32;

/// Message exchanged between a store and a proxy (or between stores).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyMessage<D, O> {
    /// Replace (merge) the receiver's model with this one.
    ModelUpdate { model: D, id: Option<ProxyId> },
    /// Apply these operations in order.
    Operations {
        operations: Vec<O>,
        id: Option<ProxyId>,
    },
    /// Send back the current model.
    SyncRequest { id: Option<ProxyId> },
}

impl<D, O> ProxyMessage<D, O> {
    /// The proxy the message originated from, if any.
    pub fn id(&self) -> Option<ProxyId> {
        match self {
            Self::ModelUpdate { id, .. }
            | Self::Operations { id, .. }
            | Self::SyncRequest { id } => *id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ModelUpdate { .. } => "model-update",
            Self::Operations { .. } => "operations",
            Self::SyncRequest { .. } => "sync-request",
        }
    }
}

/// Messages between a reference-mode store and its proxies.
pub type RefModeMessage = ProxyMessage<RefModeStoreData, RefModeStoreOp>;

/// Messages between a reference-mode store and its container store.
pub type ContainerMessage = ProxyMessage<ContainerData, ContainerOp>;

impl<D: HasKind, O: HasKind> ProxyMessage<D, O> {
    /// Check that this message addresses a store of `kind`.
    ///
    /// A model or operation of the other kind is a model error.
    pub fn sanitize(self, kind: StoreKind) -> RefModeResult<Self> {
        match &self {
            Self::ModelUpdate { model, .. } => check_kind(kind, model.kind())?,
            Self::Operations { operations, .. } => {
                for op in operations {
                    check_kind(kind, op.kind())?;
                }
            }
            Self::SyncRequest { .. } => {}
        }
        Ok(self)
    }
}

pub(crate) fn check_kind(expected: StoreKind, found: StoreKind) -> Result<(), CrdtError> {
    if expected != found {
        return Err(CrdtError::WrongKind {
            expected: expected.as_str(),
            found: found.as_str(),
        });
    }
    Ok(())
}
