//! The container ("structure") store: a reference-valued CRDT shared by
//! every reference-mode store writing to the same key.

use std::sync::Mutex;

use async_trait::async_trait;
use strata_crdt::{CrdtError, CrdtModel, CrdtSet, CrdtSingleton};
use strata_types::StorageKey;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::data::{ContainerData, ContainerOp, HasKind, StoreKind};
use crate::entity::Reference;
use crate::error::{RefModeError, RefModeResult};
use crate::message::{ContainerMessage, ProxyMessage};

/// A change applied to the container, tagged with the writer that made it.
#[derive(Clone, Debug)]
pub struct ContainerNotification {
    pub writer: Uuid,
    pub message: ContainerMessage,
}

/// Storage for the reference-valued model of a reference-mode store.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    fn kind(&self) -> StoreKind;

    /// A copy of the current model.
    async fn local_data(&self) -> ContainerData;

    /// Apply a message on behalf of `writer`.
    ///
    /// Returns `false` if any operation was rejected; operations before the
    /// rejected one stay applied.
    async fn on_proxy_message(
        &self,
        message: ContainerMessage,
        writer: Uuid,
    ) -> RefModeResult<bool>;

    /// Changes applied by any writer, including the subscriber itself.
    fn subscribe(&self) -> broadcast::Receiver<ContainerNotification>;
}

enum ContainerModel {
    Set(CrdtSet<Reference>),
    Singleton(CrdtSingleton<Reference>),
}

impl ContainerModel {
    fn new(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Collection => Self::Set(CrdtSet::new()),
            StoreKind::Singleton => Self::Singleton(CrdtSingleton::new()),
        }
    }

    fn data(&self) -> ContainerData {
        match self {
            Self::Set(set) => ContainerData::Set(set.data()),
            Self::Singleton(singleton) => ContainerData::Singleton(singleton.data()),
        }
    }

    fn apply(&mut self, op: &ContainerOp) -> RefModeResult<bool> {
        match (self, op) {
            (Self::Set(set), ContainerOp::Set(op)) => Ok(set.apply_operation(op)?),
            (Self::Singleton(singleton), ContainerOp::Singleton(op)) => {
                Ok(singleton.apply_operation(op)?)
            }
            (model, op) => Err(wrong_kind(model.kind(), op.kind())),
        }
    }

    /// Merge `data` in, returning whether the local model changed.
    fn merge(&mut self, data: &ContainerData) -> RefModeResult<bool> {
        let changed = match (self, data) {
            (Self::Set(set), ContainerData::Set(data)) => {
                !set.merge(data)?.model_change.is_empty()
            }
            (Self::Singleton(singleton), ContainerData::Singleton(data)) => {
                !singleton.merge(data)?.model_change.is_empty()
            }
            (model, data) => return Err(wrong_kind(model.kind(), data.kind())),
        };
        Ok(changed)
    }

    fn kind(&self) -> StoreKind {
        match self {
            Self::Set(_) => StoreKind::Collection,
            Self::Singleton(_) => StoreKind::Singleton,
        }
    }
}

fn wrong_kind(expected: StoreKind, found: StoreKind) -> RefModeError {
    CrdtError::WrongKind {
        expected: expected.as_str(),
        found: found.as_str(),
    }
    .into()
}

/// CRDT-backed [`ContainerStore`] held in memory.
pub struct InMemoryContainerStore {
    storage_key: StorageKey,
    kind: StoreKind,
    model: Mutex<ContainerModel>,
    sender: broadcast::Sender<ContainerNotification>,
}

impl InMemoryContainerStore {
    pub fn new(storage_key: StorageKey, kind: StoreKind, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            storage_key,
            kind,
            model: Mutex::new(ContainerModel::new(kind)),
            sender,
        }
    }

    fn notify(&self, writer: Uuid, message: ContainerMessage) {
        let kind = message.kind_name();
        if self
            .sender
            .send(ContainerNotification { writer, message })
            .is_err()
        {
            debug!(%writer, kind, "no container store subscribers");
        }
    }
}

#[async_trait]
impl ContainerStore for InMemoryContainerStore {
    fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn local_data(&self) -> ContainerData {
        self.model.lock().expect("lock poisoned").data()
    }

    async fn on_proxy_message(
        &self,
        message: ContainerMessage,
        writer: Uuid,
    ) -> RefModeResult<bool> {
        let message = message.sanitize(self.kind)?;
        match message {
            ProxyMessage::Operations { operations, id } => {
                let (applied, accepted) = {
                    let mut model = self.model.lock().expect("lock poisoned");
                    let mut applied = Vec::with_capacity(operations.len());
                    let mut accepted = true;
                    for op in operations {
                        if !model.apply(&op)? {
                            accepted = false;
                            break;
                        }
                        applied.push(op);
                    }
                    (applied, accepted)
                };
                if !accepted {
                    debug!(%writer, applied = applied.len(), "container rejected operation");
                }
                if !applied.is_empty() {
                    self.notify(writer, ProxyMessage::Operations {
                        operations: applied,
                        id,
                    });
                }
                Ok(accepted)
            }
            ProxyMessage::ModelUpdate { model: incoming, id } => {
                let merged = {
                    let mut model = self.model.lock().expect("lock poisoned");
                    model.merge(&incoming)?.then(|| model.data())
                };
                if let Some(merged) = merged {
                    self.notify(writer, ProxyMessage::ModelUpdate { model: merged, id });
                }
                Ok(true)
            }
            ProxyMessage::SyncRequest { .. } => {
                Err(RefModeError::UnexpectedSyncRequest("container"))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ContainerNotification> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use strata_crdt::{SetData, SetOperation, SingletonOperation, VersionMap};

    use super::*;

    fn store(kind: StoreKind) -> InMemoryContainerStore {
        let key = StorageKey::new("ramdisk", "container").unwrap();
        InMemoryContainerStore::new(key, kind, 16)
    }

    fn reference(id: &str) -> Reference {
        let key = StorageKey::new("ramdisk", "backing").unwrap();
        Reference::new(id, key, VersionMap::from([("w", 1)]))
    }

    fn add(id: &str, version: u64) -> ContainerOp {
        ContainerOp::Set(SetOperation::Add {
            actor: "me".into(),
            clock: VersionMap::from([("me", version)]),
            added: reference(id),
        })
    }

    fn operations(operations: Vec<ContainerOp>, id: Option<u32>) -> ContainerMessage {
        ProxyMessage::Operations { operations, id }
    }

    #[tokio::test]
    async fn operations_apply_and_notify() {
        let store = store(StoreKind::Collection);
        let mut rx = store.subscribe();
        let writer = Uuid::new_v4();

        let ok = store
            .on_proxy_message(operations(vec![add("a", 1), add("b", 2)], Some(1)), writer)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(store.local_data().await.values().len(), 2);

        let note = rx.recv().await.unwrap();
        assert_eq!(note.writer, writer);
        assert!(matches!(
            note.message,
            ProxyMessage::Operations { ref operations, id: Some(1) } if operations.len() == 2
        ));
    }

    #[tokio::test]
    async fn rejected_operation_keeps_applied_prefix() {
        let store = store(StoreKind::Collection);
        let ok = store
            .on_proxy_message(operations(vec![add("a", 1), add("b", 5)], None), Uuid::new_v4())
            .await
            .unwrap();
        assert!(!ok);
        let data = store.local_data().await;
        assert_eq!(data.values().keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn model_update_merges() {
        let store = store(StoreKind::Singleton);
        let mut rx = store.subscribe();
        let mut values = std::collections::BTreeMap::new();
        values.insert(
            "a".to_string(),
            strata_crdt::DataValue::new(reference("a"), VersionMap::from([("them", 1)])),
        );
        let data = SetData::new(VersionMap::from([("them", 1)]), values);
        let incoming = ContainerData::Singleton(data);

        let update = ProxyMessage::ModelUpdate {
            model: incoming.clone(),
            id: None,
        };
        assert!(store.on_proxy_message(update.clone(), Uuid::new_v4()).await.unwrap());
        assert_eq!(store.local_data().await, incoming);
        assert!(rx.recv().await.is_ok());

        // Merging the same model again changes nothing and stays quiet.
        assert!(store.on_proxy_message(update, Uuid::new_v4()).await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected() {
        let store = store(StoreKind::Singleton);
        let err = store
            .on_proxy_message(operations(vec![add("a", 1)], None), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, RefModeError::Crdt(CrdtError::WrongKind { .. })));

        let clear = ContainerOp::Singleton(SingletonOperation::Clear {
            actor: "me".into(),
            clock: VersionMap::new(),
        });
        assert!(store
            .on_proxy_message(operations(vec![clear], None), Uuid::new_v4())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sync_requests_are_not_served() {
        let store = store(StoreKind::Collection);
        let err = store
            .on_proxy_message(ProxyMessage::SyncRequest { id: Some(1) }, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, RefModeError::UnexpectedSyncRequest("container")));
    }
}
