use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_crdt::VersionMap;
use strata_types::{Referencable, ReferenceId, StorageKey};

/// Timestamp value meaning "never set".
pub const UNINITIALIZED_TIMESTAMP: i64 = -1;

/// A primitive or reference field value of a [`RawEntity`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Reference(Reference),
}

/// A whole record, addressed by id in the backing store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: ReferenceId,
    /// Single-valued fields; `None` marks a field that is declared but unset.
    pub singletons: BTreeMap<String, Option<FieldValue>>,
    pub collections: BTreeMap<String, Vec<FieldValue>>,
    pub creation_timestamp: i64,
    pub expiration_timestamp: i64,
}

impl RawEntity {
    /// An entity with no fields.
    pub fn new(id: impl Into<ReferenceId>) -> Self {
        Self {
            id: id.into(),
            singletons: BTreeMap::new(),
            collections: BTreeMap::new(),
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
        }
    }

    pub fn with_singleton(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.singletons.insert(name.into(), Some(value));
        self
    }

    pub fn with_collection(mut self, name: impl Into<String>, values: Vec<FieldValue>) -> Self {
        self.collections.insert(name.into(), values);
        self
    }

    /// `true` if no field holds a value.
    pub fn is_blank(&self) -> bool {
        self.singletons.values().all(Option::is_none)
            && self.collections.values().all(Vec::is_empty)
    }
}

impl Referencable for RawEntity {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Pointer from the container store into the backing store.
///
/// A reference and its entity share an id, but `version` is the entity's
/// version in the backing store, which evolves independently of the
/// container's own clock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub storage_key: StorageKey,
    pub version: VersionMap,
    pub creation_timestamp: i64,
    pub expiration_timestamp: i64,
}

impl Reference {
    pub fn new(id: impl Into<ReferenceId>, storage_key: StorageKey, version: VersionMap) -> Self {
        Self {
            id: id.into(),
            storage_key,
            version,
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
        }
    }

    /// Reference `entity` at `version`, carrying over its timestamps.
    pub fn for_entity(entity: &RawEntity, storage_key: StorageKey, version: VersionMap) -> Self {
        Self {
            id: entity.id.clone(),
            storage_key,
            version,
            creation_timestamp: entity.creation_timestamp,
            expiration_timestamp: entity.expiration_timestamp,
        }
    }
}

impl Referencable for Reference {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entity_is_blank() {
        let entity = RawEntity::new("e1");
        assert!(entity.is_blank());
        assert_eq!(entity.creation_timestamp, UNINITIALIZED_TIMESTAMP);
        assert_eq!(entity.id(), "e1");
    }

    #[test]
    fn entity_with_fields_is_not_blank() {
        let entity = RawEntity::new("e1").with_singleton("name", FieldValue::Text("bob".into()));
        assert!(!entity.is_blank());

        let empty_list = RawEntity::new("e2").with_collection("tags", Vec::new());
        assert!(empty_list.is_blank());
    }

    #[test]
    fn reference_keeps_entity_timestamps() {
        let mut entity = RawEntity::new("e1");
        entity.creation_timestamp = 10;
        let key = StorageKey::new("ramdisk", "backing").unwrap();
        let reference = Reference::for_entity(&entity, key.clone(), VersionMap::from([("w", 1)]));
        assert_eq!(reference.id(), "e1");
        assert_eq!(reference.storage_key, key);
        assert_eq!(reference.creation_timestamp, 10);
        assert_eq!(reference.expiration_timestamp, UNINITIALIZED_TIMESTAMP);
    }

    #[test]
    fn entity_serde_roundtrip() {
        let entity = RawEntity::new("e1")
            .with_singleton("age", FieldValue::Integer(42))
            .with_collection("flags", vec![FieldValue::Boolean(true)]);
        let json = serde_json::to_string(&entity).unwrap();
        let parsed: RawEntity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entity);
    }
}
