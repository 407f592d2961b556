//! Translation between the logical (entity-valued) and container
//! (reference-valued) views of a reference-mode store.
//!
//! A logical operation becomes a [`BridgingOperation`], which pairs the
//! container op to apply with the logical op it came from. Resolving the
//! reference version of an added entity is the only asynchronous step; it
//! happens here, before any CRDT op is built, through an
//! [`ItemVersionGetter`]. Removals only need the id and never resolve a
//! version.
//!
//! Fast-forward operations have no logical counterpart and fail with
//! [`RefModeError::UnsupportedFastForward`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use strata_crdt::{DataValue, SetData, SetOperation, SingletonOperation, VersionMap};
use strata_types::{ReferenceId, StorageKey};

use crate::data::{ContainerData, ContainerOp, RefModeStoreData, RefModeStoreOp};
use crate::entity::{RawEntity, Reference};
use crate::error::{RefModeError, RefModeResult};

/// Resolves the backing-store version an entity should be referenced at.
#[async_trait]
pub trait ItemVersionGetter: Send + Sync {
    async fn version_of(&self, entity: &RawEntity) -> RefModeResult<VersionMap>;
}

/// A container op paired with the logical op it corresponds to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgingOperation {
    UpdateSingleton {
        entity_value: RawEntity,
        reference_value: Reference,
        container_op: SingletonOperation<Reference>,
        ref_mode_op: SingletonOperation<RawEntity>,
    },
    ClearSingleton {
        container_op: SingletonOperation<Reference>,
        ref_mode_op: SingletonOperation<RawEntity>,
    },
    AddToSet {
        entity_value: RawEntity,
        reference_value: Reference,
        container_op: SetOperation<Reference>,
        ref_mode_op: SetOperation<RawEntity>,
    },
    RemoveFromSet {
        entity_value: RawEntity,
        reference_value: Reference,
        container_op: SetOperation<Reference>,
        ref_mode_op: SetOperation<RawEntity>,
    },
    ClearSet {
        container_op: SetOperation<Reference>,
        ref_mode_op: SetOperation<RawEntity>,
    },
}

impl BridgingOperation {
    pub fn entity_value(&self) -> Option<&RawEntity> {
        match self {
            Self::UpdateSingleton { entity_value, .. }
            | Self::AddToSet { entity_value, .. }
            | Self::RemoveFromSet { entity_value, .. } => Some(entity_value),
            Self::ClearSingleton { .. } | Self::ClearSet { .. } => None,
        }
    }

    pub fn reference_value(&self) -> Option<&Reference> {
        match self {
            Self::UpdateSingleton {
                reference_value, ..
            }
            | Self::AddToSet {
                reference_value, ..
            }
            | Self::RemoveFromSet {
                reference_value, ..
            } => Some(reference_value),
            Self::ClearSingleton { .. } | Self::ClearSet { .. } => None,
        }
    }

    pub fn container_op(&self) -> ContainerOp {
        match self {
            Self::UpdateSingleton { container_op, .. }
            | Self::ClearSingleton { container_op, .. } => {
                ContainerOp::Singleton(container_op.clone())
            }
            Self::AddToSet { container_op, .. }
            | Self::RemoveFromSet { container_op, .. }
            | Self::ClearSet { container_op, .. } => ContainerOp::Set(container_op.clone()),
        }
    }

    pub fn ref_mode_op(&self) -> RefModeStoreOp {
        match self {
            Self::UpdateSingleton { ref_mode_op, .. }
            | Self::ClearSingleton { ref_mode_op, .. } => {
                RefModeStoreOp::Singleton(ref_mode_op.clone())
            }
            Self::AddToSet { ref_mode_op, .. }
            | Self::RemoveFromSet { ref_mode_op, .. }
            | Self::ClearSet { ref_mode_op, .. } => RefModeStoreOp::Set(ref_mode_op.clone()),
        }
    }
}

/// A logical model split into its entities and its container model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgingData {
    /// Distinct entities referenced by the model, ordered by id.
    pub backing_models: Vec<RawEntity>,
    pub container_data: ContainerData,
}

/// Split a logical model into entities plus a reference-valued model.
pub async fn to_bridging_data<G>(
    data: &RefModeStoreData,
    backing_key: &StorageKey,
    getter: &G,
) -> RefModeResult<BridgingData>
where
    G: ItemVersionGetter + ?Sized,
{
    let mut references = BTreeMap::new();
    let mut backing_models = Vec::with_capacity(data.values().len());
    for (id, entry) in data.values() {
        let version = getter.version_of(&entry.value).await?;
        let reference = Reference::for_entity(&entry.value, backing_key.clone(), version);
        references.insert(
            id.clone(),
            DataValue::new(reference, entry.version_map.clone()),
        );
        backing_models.push(entry.value.clone());
    }

    let container = SetData::new(data.version_map().clone(), references);
    let container_data = match data {
        RefModeStoreData::Set(_) => ContainerData::Set(container),
        RefModeStoreData::Singleton(_) => ContainerData::Singleton(container),
    };
    Ok(BridgingData {
        backing_models,
        container_data,
    })
}

/// Rebuild a logical model from a container model and the entities it
/// references. References with no entity in `entities` resolve to a blank
/// entity with the referenced id.
pub fn to_ref_mode_data(
    container: &ContainerData,
    entities: &BTreeMap<ReferenceId, RawEntity>,
) -> RefModeStoreData {
    let values = container
        .values()
        .iter()
        .map(|(id, entry)| {
            let entity = entities
                .get(id)
                .cloned()
                .unwrap_or_else(|| RawEntity::new(id.clone()));
            (id.clone(), DataValue::new(entity, entry.version_map.clone()))
        })
        .collect();
    let data = SetData::new(container.version_map().clone(), values);
    match container {
        ContainerData::Set(_) => RefModeStoreData::Set(data),
        ContainerData::Singleton(_) => RefModeStoreData::Singleton(data),
    }
}

/// Bridge one logical operation.
pub async fn to_bridging_op<G>(
    op: &RefModeStoreOp,
    backing_key: &StorageKey,
    getter: &G,
) -> RefModeResult<BridgingOperation>
where
    G: ItemVersionGetter + ?Sized,
{
    match op {
        RefModeStoreOp::Set(SetOperation::Add {
            actor,
            clock,
            added,
        }) => {
            let version = getter.version_of(added).await?;
            let reference = Reference::for_entity(added, backing_key.clone(), version);
            Ok(BridgingOperation::AddToSet {
                entity_value: added.clone(),
                reference_value: reference.clone(),
                container_op: SetOperation::Add {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    added: reference,
                },
                ref_mode_op: SetOperation::Add {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    added: added.clone(),
                },
            })
        }
        RefModeStoreOp::Set(SetOperation::Remove {
            actor,
            clock,
            removed,
        }) => {
            let reference =
                Reference::new(removed.id.clone(), backing_key.clone(), VersionMap::new());
            Ok(BridgingOperation::RemoveFromSet {
                entity_value: removed.clone(),
                reference_value: reference.clone(),
                container_op: SetOperation::Remove {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    removed: reference,
                },
                ref_mode_op: SetOperation::Remove {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    removed: removed.clone(),
                },
            })
        }
        RefModeStoreOp::Set(SetOperation::Clear { actor, clock }) => {
            Ok(BridgingOperation::ClearSet {
                container_op: SetOperation::Clear {
                    actor: actor.clone(),
                    clock: clock.clone(),
                },
                ref_mode_op: SetOperation::Clear {
                    actor: actor.clone(),
                    clock: clock.clone(),
                },
            })
        }
        RefModeStoreOp::Singleton(SingletonOperation::Update {
            actor,
            clock,
            value,
        }) => {
            let version = getter.version_of(value).await?;
            let reference = Reference::for_entity(value, backing_key.clone(), version);
            Ok(BridgingOperation::UpdateSingleton {
                entity_value: value.clone(),
                reference_value: reference.clone(),
                container_op: SingletonOperation::Update {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    value: reference,
                },
                ref_mode_op: SingletonOperation::Update {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    value: value.clone(),
                },
            })
        }
        RefModeStoreOp::Singleton(SingletonOperation::Clear { actor, clock }) => {
            Ok(BridgingOperation::ClearSingleton {
                container_op: SingletonOperation::Clear {
                    actor: actor.clone(),
                    clock: clock.clone(),
                },
                ref_mode_op: SingletonOperation::Clear {
                    actor: actor.clone(),
                    clock: clock.clone(),
                },
            })
        }
        RefModeStoreOp::Set(SetOperation::FastForward(_)) => {
            Err(RefModeError::UnsupportedFastForward("set"))
        }
        RefModeStoreOp::Singleton(SingletonOperation::FastForward(_)) => {
            Err(RefModeError::UnsupportedFastForward("singleton"))
        }
    }
}

/// Bridge a batch of logical operations, in order.
pub async fn to_bridging_ops<G>(
    ops: &[RefModeStoreOp],
    backing_key: &StorageKey,
    getter: &G,
) -> RefModeResult<Vec<BridgingOperation>>
where
    G: ItemVersionGetter + ?Sized,
{
    let mut bridged = Vec::with_capacity(ops.len());
    for op in ops {
        bridged.push(to_bridging_op(op, backing_key, getter).await?);
    }
    Ok(bridged)
}

/// Bridge a container set op back to its logical form.
///
/// `entity` is the backing-store entity for the referenced id, if known;
/// otherwise a blank entity with that id stands in.
pub fn set_to_bridging_op(
    op: &SetOperation<Reference>,
    entity: Option<RawEntity>,
) -> RefModeResult<BridgingOperation> {
    match op {
        SetOperation::Add {
            actor,
            clock,
            added,
        } => {
            let entity = entity.unwrap_or_else(|| RawEntity::new(added.id.clone()));
            Ok(BridgingOperation::AddToSet {
                entity_value: entity.clone(),
                reference_value: added.clone(),
                container_op: op.clone(),
                ref_mode_op: SetOperation::Add {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    added: entity,
                },
            })
        }
        SetOperation::Remove {
            actor,
            clock,
            removed,
        } => {
            let entity = entity.unwrap_or_else(|| RawEntity::new(removed.id.clone()));
            Ok(BridgingOperation::RemoveFromSet {
                entity_value: entity.clone(),
                reference_value: removed.clone(),
                container_op: op.clone(),
                ref_mode_op: SetOperation::Remove {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    removed: entity,
                },
            })
        }
        SetOperation::Clear { actor, clock } => Ok(BridgingOperation::ClearSet {
            container_op: op.clone(),
            ref_mode_op: SetOperation::Clear {
                actor: actor.clone(),
                clock: clock.clone(),
            },
        }),
        SetOperation::FastForward(_) => Err(RefModeError::UnsupportedFastForward("set")),
    }
}

/// Bridge a container singleton op back to its logical form.
pub fn singleton_to_bridging_op(
    op: &SingletonOperation<Reference>,
    entity: Option<RawEntity>,
) -> RefModeResult<BridgingOperation> {
    match op {
        SingletonOperation::Update {
            actor,
            clock,
            value,
        } => {
            let entity = entity.unwrap_or_else(|| RawEntity::new(value.id.clone()));
            Ok(BridgingOperation::UpdateSingleton {
                entity_value: entity.clone(),
                reference_value: value.clone(),
                container_op: op.clone(),
                ref_mode_op: SingletonOperation::Update {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    value: entity,
                },
            })
        }
        SingletonOperation::Clear { actor, clock } => Ok(BridgingOperation::ClearSingleton {
            container_op: op.clone(),
            ref_mode_op: SingletonOperation::Clear {
                actor: actor.clone(),
                clock: clock.clone(),
            },
        }),
        SingletonOperation::FastForward(_) => {
            Err(RefModeError::UnsupportedFastForward("singleton"))
        }
    }
}

/// Bridge either kind of container op back to its logical form.
pub fn container_op_to_bridging_op(
    op: &ContainerOp,
    entity: Option<RawEntity>,
) -> RefModeResult<BridgingOperation> {
    match op {
        ContainerOp::Set(op) => set_to_bridging_op(op, entity),
        ContainerOp::Singleton(op) => singleton_to_bridging_op(op, entity),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use proptest::prelude::*;
    use strata_crdt::FastForwardOp;

    use super::*;
    use crate::data::{HasKind, StoreKind};
    use crate::entity::FieldValue;

    /// Hands out `{getter: n}` per call and records which ids were asked.
    #[derive(Default)]
    struct CountingGetter {
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ItemVersionGetter for CountingGetter {
        async fn version_of(&self, entity: &RawEntity) -> RefModeResult<VersionMap> {
            let mut asked = self.asked.lock().expect("lock poisoned");
            asked.push(entity.id.clone());
            Ok(VersionMap::from([("getter", asked.len() as u64)]))
        }
    }

    fn backing_key() -> StorageKey {
        StorageKey::new("ramdisk", "backing").unwrap()
    }

    fn entity(id: &str, name: &str) -> RawEntity {
        RawEntity::new(id).with_singleton("name", FieldValue::Text(name.into()))
    }

    #[tokio::test]
    async fn add_resolves_reference_version() {
        let getter = CountingGetter::default();
        let op = RefModeStoreOp::Set(SetOperation::Add {
            actor: "me".into(),
            clock: VersionMap::from([("me", 1)]),
            added: entity("e1", "bob"),
        });
        let bridged = to_bridging_op(&op, &backing_key(), &getter).await.unwrap();

        let reference = bridged.reference_value().unwrap();
        assert_eq!(reference.id, "e1");
        assert_eq!(reference.version, VersionMap::from([("getter", 1)]));
        assert_eq!(reference.storage_key, backing_key());
        assert_eq!(bridged.entity_value(), Some(&entity("e1", "bob")));
        assert_eq!(bridged.ref_mode_op(), op);
        assert!(matches!(
            bridged.container_op(),
            ContainerOp::Set(SetOperation::Add { added, .. }) if added == *reference
        ));
    }

    #[tokio::test]
    async fn removal_never_resolves_a_version() {
        let getter = CountingGetter::default();
        let ops = vec![
            RefModeStoreOp::Set(SetOperation::Remove {
                actor: "me".into(),
                clock: VersionMap::from([("me", 1)]),
                removed: entity("e1", "bob"),
            }),
            RefModeStoreOp::Set(SetOperation::Clear {
                actor: "me".into(),
                clock: VersionMap::from([("me", 1)]),
            }),
            RefModeStoreOp::Singleton(SingletonOperation::Clear {
                actor: "me".into(),
                clock: VersionMap::from([("me", 1)]),
            }),
        ];
        let bridged = to_bridging_ops(&ops, &backing_key(), &getter).await.unwrap();
        assert_eq!(bridged.len(), 3);
        assert!(getter.asked.lock().unwrap().is_empty());
        assert!(matches!(bridged[0], BridgingOperation::RemoveFromSet { .. }));
        assert_eq!(bridged[0].reference_value().unwrap().version, VersionMap::new());
        assert!(matches!(bridged[1], BridgingOperation::ClearSet { .. }));
        assert!(matches!(bridged[2], BridgingOperation::ClearSingleton { .. }));
        assert_eq!(bridged[2].entity_value(), None);
    }

    #[tokio::test]
    async fn singleton_update_bridges_to_update() {
        let getter = CountingGetter::default();
        let op = RefModeStoreOp::Singleton(SingletonOperation::Update {
            actor: "me".into(),
            clock: VersionMap::from([("me", 1)]),
            value: entity("e1", "bob"),
        });
        let bridged = to_bridging_op(&op, &backing_key(), &getter).await.unwrap();
        assert!(matches!(bridged, BridgingOperation::UpdateSingleton { .. }));
        assert_eq!(bridged.container_op().kind(), StoreKind::Singleton);
    }

    #[tokio::test]
    async fn fast_forward_cannot_be_bridged() {
        let getter = CountingGetter::default();
        let op = RefModeStoreOp::Set(SetOperation::FastForward(FastForwardOp::new(
            VersionMap::new(),
            VersionMap::from([("me", 1)]),
        )));
        let err = to_bridging_op(&op, &backing_key(), &getter).await.unwrap_err();
        assert!(matches!(err, RefModeError::UnsupportedFastForward("set")));

        let container_ff = SingletonOperation::FastForward(FastForwardOp::new(
            VersionMap::new(),
            VersionMap::new(),
        ));
        assert!(matches!(
            singleton_to_bridging_op(&container_ff, None),
            Err(RefModeError::UnsupportedFastForward("singleton"))
        ));
    }

    #[test]
    fn reverse_bridging_uses_blank_entity_when_unknown() {
        let reference = Reference::new("e9", backing_key(), VersionMap::from([("w", 2)]));
        let op = SetOperation::Remove {
            actor: "other".into(),
            clock: VersionMap::from([("other", 3)]),
            removed: reference.clone(),
        };
        let bridged = set_to_bridging_op(&op, None).unwrap();
        assert_eq!(bridged.entity_value(), Some(&RawEntity::new("e9")));
        assert_eq!(bridged.reference_value(), Some(&reference));
        assert_eq!(
            bridged.ref_mode_op(),
            RefModeStoreOp::Set(SetOperation::Remove {
                actor: "other".into(),
                clock: VersionMap::from([("other", 3)]),
                removed: RawEntity::new("e9"),
            })
        );
    }

    #[test]
    fn reverse_bridging_prefers_known_entity() {
        let reference = Reference::new("e1", backing_key(), VersionMap::from([("w", 1)]));
        let op = ContainerOp::Singleton(SingletonOperation::Update {
            actor: "other".into(),
            clock: VersionMap::from([("other", 1)]),
            value: reference,
        });
        let bridged = container_op_to_bridging_op(&op, Some(entity("e1", "ann"))).unwrap();
        assert_eq!(bridged.entity_value(), Some(&entity("e1", "ann")));
        assert_eq!(bridged.container_op(), op);
    }

    #[tokio::test]
    async fn bridging_data_splits_model() {
        let getter = CountingGetter::default();
        let mut values = BTreeMap::new();
        for id in ["a", "b"] {
            values.insert(
                id.to_string(),
                DataValue::new(entity(id, id), VersionMap::from([("me", 1)])),
            );
        }
        let model = RefModeStoreData::Set(SetData::new(VersionMap::from([("me", 2)]), values));

        let bridged = to_bridging_data(&model, &backing_key(), &getter).await.unwrap();
        assert_eq!(bridged.backing_models, vec![entity("a", "a"), entity("b", "b")]);
        assert_eq!(bridged.container_data.kind(), StoreKind::Collection);
        assert_eq!(bridged.container_data.version_map(), model.version_map());
        let refs = bridged.container_data.values();
        assert_eq!(refs["a"].value.version, VersionMap::from([("getter", 1)]));
        assert_eq!(refs["b"].value.version, VersionMap::from([("getter", 2)]));
        assert_eq!(refs["b"].version_map, VersionMap::from([("me", 1)]));
    }

    proptest! {
        #[test]
        fn container_and_entities_rebuild_the_model(
            ids in prop::collection::btree_set("[a-z]{1,6}", 0..8),
            singleton in any::<bool>(),
        ) {
            let values: BTreeMap<_, _> = ids
                .iter()
                .map(|id| {
                    let value = DataValue::new(entity(id, "x"), VersionMap::from([("me", 1)]));
                    (id.clone(), value)
                })
                .collect();
            let data = SetData::new(VersionMap::from([("me", ids.len() as u64)]), values);
            let model = if singleton {
                RefModeStoreData::Singleton(data)
            } else {
                RefModeStoreData::Set(data)
            };

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let getter = CountingGetter::default();
            let bridged = runtime
                .block_on(to_bridging_data(&model, &backing_key(), &getter))
                .unwrap();
            let entities: BTreeMap<_, _> = bridged
                .backing_models
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect();
            prop_assert_eq!(to_ref_mode_data(&bridged.container_data, &entities), model);
        }
    }
}
