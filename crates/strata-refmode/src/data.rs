//! Data and operation shapes seen on either side of a reference-mode store.
//!
//! Proxies see [`RefModeStoreData`] / [`RefModeStoreOp`] over whole
//! entities. The container store sees [`ContainerData`] / [`ContainerOp`]
//! over [`Reference`]s. Both come in a collection and a singleton flavour,
//! chosen once per store by [`StoreKind`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_crdt::{
    DataValue, SetData, SetOperation, SingletonData, SingletonOperation, VersionMap,
};
use strata_types::ReferenceId;

use crate::entity::{RawEntity, Reference};

/// Whether a store holds a collection or a single value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Collection,
    Singleton,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Singleton => "singleton",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that is shaped for one [`StoreKind`].
pub trait HasKind {
    fn kind(&self) -> StoreKind;
}

macro_rules! kind_by_variant {
    ($($ty:ty),+) => {$(
        impl HasKind for $ty {
            fn kind(&self) -> StoreKind {
                match self {
                    Self::Set(_) => StoreKind::Collection,
                    Self::Singleton(_) => StoreKind::Singleton,
                }
            }
        }
    )+};
}

kind_by_variant!(RefModeStoreData, RefModeStoreOp, ContainerData, ContainerOp);

/// Logical model of a reference-mode store, as exchanged with proxies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefModeStoreData {
    Set(SetData<RawEntity>),
    Singleton(SingletonData<RawEntity>),
}

impl RefModeStoreData {
    /// An empty model of the given kind.
    pub fn empty(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Collection => Self::Set(SetData::default()),
            StoreKind::Singleton => Self::Singleton(SingletonData::default()),
        }
    }

    pub fn version_map(&self) -> &VersionMap {
        &self.inner().version_map
    }

    pub fn values(&self) -> &BTreeMap<ReferenceId, DataValue<RawEntity>> {
        &self.inner().values
    }

    fn inner(&self) -> &SetData<RawEntity> {
        match self {
            Self::Set(data) | Self::Singleton(data) => data,
        }
    }

    /// The caller-facing view of this model.
    pub fn consumer_view(&self) -> RefModeStoreOutput {
        let mut entities = self.values().values().map(|entry| entry.value.clone());
        match self {
            Self::Set(_) => RefModeStoreOutput::Set(entities.collect()),
            Self::Singleton(_) => RefModeStoreOutput::Singleton(entities.next()),
        }
    }
}

/// Logical operation issued by a proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefModeStoreOp {
    Set(SetOperation<RawEntity>),
    Singleton(SingletonOperation<RawEntity>),
}

impl RefModeStoreOp {
    pub fn clock(&self) -> &VersionMap {
        match self {
            Self::Set(op) => op.clock(),
            Self::Singleton(op) => op.clock(),
        }
    }
}

/// Caller-facing view of a reference-mode store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefModeStoreOutput {
    /// Entities ordered by id.
    Set(Vec<RawEntity>),
    Singleton(Option<RawEntity>),
}

/// Reference-valued model held by the container store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerData {
    Set(SetData<Reference>),
    Singleton(SingletonData<Reference>),
}

impl ContainerData {
    pub fn empty(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Collection => Self::Set(SetData::default()),
            StoreKind::Singleton => Self::Singleton(SingletonData::default()),
        }
    }

    pub fn version_map(&self) -> &VersionMap {
        &self.inner().version_map
    }

    pub fn values(&self) -> &BTreeMap<ReferenceId, DataValue<Reference>> {
        &self.inner().values
    }

    fn inner(&self) -> &SetData<Reference> {
        match self {
            Self::Set(data) | Self::Singleton(data) => data,
        }
    }
}

/// Reference-valued operation applied to the container store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerOp {
    Set(SetOperation<Reference>),
    Singleton(SingletonOperation<Reference>),
}

impl ContainerOp {
    /// The reference this op adds, replaces, or removes, if any.
    pub fn reference(&self) -> Option<&Reference> {
        match self {
            Self::Set(SetOperation::Add { added, .. }) => Some(added),
            Self::Set(SetOperation::Remove { removed, .. }) => Some(removed),
            Self::Singleton(SingletonOperation::Update { value, .. }) => Some(value),
            _ => None,
        }
    }
}
