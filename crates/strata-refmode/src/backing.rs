//! The backing ("content") store: whole entities addressed by id.
//!
//! Each entity carries its own version map, bumped by the writing actor
//! whenever its content actually changes. Every change is broadcast so that
//! reference-mode stores waiting on a particular version can release their
//! held sends.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_crdt::{CrdtError, VersionMap};
use strata_types::{Actor, ReferenceId, StorageKey};
use tokio::sync::broadcast;
use tracing::debug;

use crate::entity::RawEntity;
use crate::error::RefModeResult;
use crate::message::ProxyMessage;

/// An entity together with its backing-store version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingRecord {
    pub entity: RawEntity,
    pub version_map: VersionMap,
}

/// Operations the backing store reports to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingOp {
    /// Every field of the entity was cleared at `clock`.
    ClearAll { actor: Actor, clock: VersionMap },
}

impl BackingOp {
    pub fn clock(&self) -> &VersionMap {
        match self {
            Self::ClearAll { clock, .. } => clock,
        }
    }
}

/// Change notification for a single entity.
pub type BackingMessage = ProxyMessage<BackingRecord, BackingOp>;

/// A [`BackingMessage`] tagged with the entity id it concerns.
#[derive(Clone, Debug)]
pub struct BackingNotification {
    pub mux_id: ReferenceId,
    pub message: BackingMessage,
}

/// Storage for whole entities.
#[async_trait]
pub trait BackingStore: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    async fn get(&self, id: &str) -> Option<BackingRecord>;

    /// Version of the entity, empty if it has never been written.
    async fn version_of(&self, id: &str) -> VersionMap;

    /// Store `entity`, returning its version after the write.
    ///
    /// Writing content identical to what is stored leaves the version alone.
    async fn write(&self, actor: &Actor, entity: &RawEntity) -> RefModeResult<VersionMap>;

    /// Clear every field of the entity, bumping its version if any field
    /// was set. Returns `false` if it was never written.
    async fn clear(&self, actor: &Actor, id: &str) -> RefModeResult<bool>;

    fn subscribe(&self) -> broadcast::Receiver<BackingNotification>;
}

/// `HashMap`-backed [`BackingStore`] for tests and embedding.
pub struct InMemoryBackingStore {
    storage_key: StorageKey,
    records: RwLock<HashMap<ReferenceId, BackingRecord>>,
    sender: broadcast::Sender<BackingNotification>,
}

impl InMemoryBackingStore {
    pub fn new(storage_key: StorageKey, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            storage_key,
            records: RwLock::new(HashMap::new()),
            sender,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().expect("lock poisoned").is_empty()
    }

    /// Store a record verbatim, as a remote replica's write would arrive.
    pub fn put(&self, record: BackingRecord) {
        let id = record.entity.id.clone();
        self.records
            .write()
            .expect("lock poisoned")
            .insert(id.clone(), record.clone());
        self.notify(id, ProxyMessage::ModelUpdate {
            model: record,
            id: None,
        });
    }

    fn notify(&self, mux_id: ReferenceId, message: BackingMessage) {
        let kind = message.kind_name();
        if self
            .sender
            .send(BackingNotification {
                mux_id: mux_id.clone(),
                message,
            })
            .is_err()
        {
            debug!(%mux_id, kind, "no backing store subscribers");
        }
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    async fn get(&self, id: &str) -> Option<BackingRecord> {
        self.records.read().expect("lock poisoned").get(id).cloned()
    }

    async fn version_of(&self, id: &str) -> VersionMap {
        self.records
            .read()
            .expect("lock poisoned")
            .get(id)
            .map(|record| record.version_map.clone())
            .unwrap_or_default()
    }

    async fn write(&self, actor: &Actor, entity: &RawEntity) -> RefModeResult<VersionMap> {
        if entity.id.is_empty() {
            return Err(CrdtError::MissingId.into());
        }
        let record = {
            let mut records = self.records.write().expect("lock poisoned");
            let version_map = match records.get(&entity.id) {
                Some(existing) if existing.entity == *entity => {
                    return Ok(existing.version_map.clone());
                }
                Some(existing) => existing.version_map.incremented(actor.clone()),
                None => VersionMap::new().incremented(actor.clone()),
            };
            let record = BackingRecord {
                entity: entity.clone(),
                version_map,
            };
            records.insert(entity.id.clone(), record.clone());
            record
        };
        debug!(id = %entity.id, version = %record.version_map, "wrote entity");
        let version = record.version_map.clone();
        self.notify(entity.id.clone(), ProxyMessage::ModelUpdate {
            model: record,
            id: None,
        });
        Ok(version)
    }

    async fn clear(&self, actor: &Actor, id: &str) -> RefModeResult<bool> {
        let clock = {
            let mut records = self.records.write().expect("lock poisoned");
            let Some(record) = records.get_mut(id) else {
                return Ok(false);
            };
            if record.entity.is_blank() {
                return Ok(true);
            }
            record.entity = RawEntity {
                creation_timestamp: record.entity.creation_timestamp,
                expiration_timestamp: record.entity.expiration_timestamp,
                ..RawEntity::new(id)
            };
            record.version_map.increment(actor.clone());
            record.version_map.clone()
        };
        debug!(%id, version = %clock, "cleared entity");
        self.notify(id.to_string(), ProxyMessage::Operations {
            operations: vec![BackingOp::ClearAll {
                actor: actor.clone(),
                clock,
            }],
            id: None,
        });
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<BackingNotification> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FieldValue;

    fn store() -> InMemoryBackingStore {
        InMemoryBackingStore::new(StorageKey::new("ramdisk", "backing").unwrap(), 16)
    }

    fn entity(name: &str) -> RawEntity {
        RawEntity::new("e1").with_singleton("name", FieldValue::Text(name.into()))
    }

    #[tokio::test]
    async fn write_bumps_version_only_on_change() {
        let store = store();
        let me: Actor = "me".into();
        assert!(store.version_of("e1").await.is_empty());

        let v1 = store.write(&me, &entity("bob")).await.unwrap();
        assert_eq!(v1, VersionMap::from([("me", 1)]));
        let again = store.write(&me, &entity("bob")).await.unwrap();
        assert_eq!(again, v1);
        let v2 = store.write(&me, &entity("ann")).await.unwrap();
        assert_eq!(v2, VersionMap::from([("me", 2)]));

        let record = store.get("e1").await.unwrap();
        assert_eq!(record.entity, entity("ann"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn write_without_id_is_rejected() {
        let store = store();
        let err = store.write(&"me".into(), &RawEntity::new("")).await.unwrap_err();
        assert!(matches!(err, crate::error::RefModeError::Crdt(CrdtError::MissingId)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clear_bumps_version_and_blanks_fields() {
        let store = store();
        let me: Actor = "me".into();
        assert!(!store.clear(&me, "e1").await.unwrap());

        store.write(&me, &entity("bob")).await.unwrap();
        assert!(store.clear(&me, "e1").await.unwrap());
        let record = store.get("e1").await.unwrap();
        assert!(record.entity.is_blank());
        assert_eq!(record.version_map, VersionMap::from([("me", 2)]));

        // Clearing a blank entity is a no-op.
        assert!(store.clear(&me, "e1").await.unwrap());
        assert_eq!(store.version_of("e1").await, VersionMap::from([("me", 2)]));
    }

    #[tokio::test]
    async fn cleared_entity_is_newer_than_its_last_write() {
        let store = store();
        let me: Actor = "me".into();
        let them: Actor = "them".into();
        let written = store.write(&them, &entity("bob")).await.unwrap();
        store.clear(&me, "e1").await.unwrap();

        let cleared = store.version_of("e1").await;
        assert!(cleared.dominates(&written));
        assert_ne!(cleared, written);

        // Writing the old content back is a change again.
        let rewritten = store.write(&them, &entity("bob")).await.unwrap();
        assert!(rewritten.dominates(&cleared));
        assert_ne!(rewritten, cleared);
    }

    #[tokio::test]
    async fn changes_are_broadcast() {
        let store = store();
        let mut rx = store.subscribe();
        let me: Actor = "me".into();

        store.write(&me, &entity("bob")).await.unwrap();
        store.write(&me, &entity("bob")).await.unwrap();
        store.clear(&me, "e1").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.mux_id, "e1");
        assert!(matches!(
            first.message,
            ProxyMessage::ModelUpdate { ref model, .. }
                if model.version_map == VersionMap::from([("me", 1)])
        ));
        let second = rx.recv().await.unwrap();
        let ProxyMessage::Operations { operations, .. } = second.message else {
            panic!("expected a clear operation");
        };
        assert_eq!(operations, vec![BackingOp::ClearAll {
            actor: me,
            clock: VersionMap::from([("me", 2)]),
        }]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn put_stores_remote_record() {
        let store = store();
        let mut rx = store.subscribe();
        store.put(BackingRecord {
            entity: entity("remote"),
            version_map: VersionMap::from([("them", 4)]),
        });
        assert_eq!(store.version_of("e1").await, VersionMap::from([("them", 4)]));
        assert_eq!(rx.recv().await.unwrap().mux_id, "e1");
    }
}
