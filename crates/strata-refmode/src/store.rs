//! The reference-mode store.
//!
//! A [`ReferenceModeStore`] presents proxies with a logical collection or
//! singleton of whole entities while persisting it as two parts: a container
//! store holding [`Reference`]s, and a backing store holding the entities.
//!
//! Everything that mutates the store goes through one [`MessageQueue`]:
//! proxy messages, container notifications from other writers, and backing
//! notifications. Outbound traffic to proxies goes through a [`SendQueue`]
//! so that a message referencing an entity the backing store does not yet
//! hold at the referenced version waits for it, and blocks everything sent
//! after it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use strata_crdt::{SetOperation, SingletonOperation, VersionMap};
use strata_types::{Actor, ReferenceId, ReferenceModeStorageKey, StorageKey};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backing::{BackingMessage, BackingNotification, BackingStore, InMemoryBackingStore};
use crate::bridging::{
    container_op_to_bridging_op, to_bridging_data, to_bridging_op, to_ref_mode_data,
    BridgingOperation, ItemVersionGetter,
};
use crate::config::StoreConfig;
use crate::container::{ContainerNotification, ContainerStore, InMemoryContainerStore};
use crate::data::{ContainerData, ContainerOp, RefModeStoreData, RefModeStoreOp, StoreKind};
use crate::entity::{RawEntity, Reference};
use crate::error::{RefModeError, RefModeResult};
use crate::message::{check_kind, ContainerMessage, ProxyId, ProxyMessage, RefModeMessage};
use crate::queue::{Message, MessageHandler, MessageQueue, Payload, WeakMessageQueue};
use crate::send_queue::{Hold, SendQueue};

/// A logical store split across a container store and a backing store.
///
/// Must be created inside a tokio runtime; it spawns tasks that forward
/// collaborator notifications into its message queue.
pub struct ReferenceModeStore {
    queue: MessageQueue<StoreInner>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ReferenceModeStore {
    /// Create a store over existing collaborators.
    ///
    /// The container must be addressed by the storage half of
    /// `storage_key` and hold `kind`; the backing store must be addressed by
    /// the backing half.
    pub fn new(
        storage_key: ReferenceModeStorageKey,
        kind: StoreKind,
        container: Arc<dyn ContainerStore>,
        backing: Arc<dyn BackingStore>,
        config: StoreConfig,
    ) -> RefModeResult<Self> {
        check_key("container", storage_key.storage_key(), container.storage_key())?;
        check_key("backing", storage_key.backing_key(), backing.storage_key())?;
        check_kind(kind, container.kind())?;

        let actor = Actor::random(&config.actor_prefix);
        let writer_id = Uuid::new_v4();
        info!(key = %storage_key, %kind, %actor, "reference-mode store started");

        let container_rx = container.subscribe();
        let backing_rx = backing.subscribe();
        let queue = MessageQueue::new_cyclic(|queue| StoreInner {
            config,
            kind,
            storage_key,
            actor,
            writer_id,
            container,
            backing,
            proxies: RwLock::new(BTreeMap::new()),
            next_proxy_id: AtomicU32::new(1),
            send_queue: Mutex::new(SendQueue::new()),
            queue,
        });
        let forwarders = vec![
            spawn_container_forwarder(queue.downgrade(), container_rx, writer_id),
            spawn_backing_forwarder(queue.downgrade(), backing_rx),
        ];
        Ok(Self { queue, forwarders })
    }

    /// Create a store over fresh in-memory collaborators.
    pub fn in_memory(
        storage_key: ReferenceModeStorageKey,
        kind: StoreKind,
        config: StoreConfig,
    ) -> RefModeResult<Self> {
        let capacity = config.notification_capacity;
        let container = Arc::new(InMemoryContainerStore::new(
            storage_key.storage_key().clone(),
            kind,
            capacity,
        ));
        let backing = Arc::new(InMemoryBackingStore::new(
            storage_key.backing_key().clone(),
            capacity,
        ));
        Self::new(storage_key, kind, container, backing, config)
    }

    pub fn storage_key(&self) -> &ReferenceModeStorageKey {
        &self.inner().storage_key
    }

    pub fn kind(&self) -> StoreKind {
        self.inner().kind
    }

    /// The actor this store writes entities and container clears as.
    pub fn actor(&self) -> &Actor {
        &self.inner().actor
    }

    pub fn container(&self) -> &Arc<dyn ContainerStore> {
        &self.inner().container
    }

    pub fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.inner().backing
    }

    /// Apply a message from a proxy.
    ///
    /// Resolves once the message has been handled. `Ok(false)` means an
    /// operation was rejected and the proxy should resync.
    pub async fn on_proxy_message(&self, message: RefModeMessage) -> RefModeResult<bool> {
        let message = message.sanitize(self.kind())?;
        self.queue
            .enqueue(Message::new(Payload::FromStorageProxy(message)))
            .await
    }

    /// Connect a proxy. Changes not caused by it arrive on the receiver.
    pub fn register_proxy(&self) -> (ProxyId, mpsc::UnboundedReceiver<RefModeMessage>) {
        let inner = self.inner();
        let id = inner.next_proxy_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        inner
            .proxies
            .write()
            .expect("lock poisoned")
            .insert(id, sender);
        debug!(proxy = id, "registered proxy");
        (id, receiver)
    }

    pub fn unregister_proxy(&self, id: ProxyId) -> bool {
        self.inner()
            .proxies
            .write()
            .expect("lock poisoned")
            .remove(&id)
            .is_some()
    }

    /// Wait until every queued message has been handled.
    pub async fn idle(&self) {
        self.queue.idle().await
    }

    /// The logical model as currently stored, without waiting on holds.
    pub async fn local_model(&self) -> RefModeStoreData {
        let inner = self.inner();
        let container = inner.container.local_data().await;
        inner.logical_model(&container).await
    }

    fn inner(&self) -> &StoreInner {
        self.queue.handler()
    }
}

impl Drop for ReferenceModeStore {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

fn check_key(store: &'static str, expected: &StorageKey, found: &StorageKey) -> RefModeResult<()> {
    if expected != found {
        return Err(RefModeError::KeyMismatch {
            store,
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

fn spawn_container_forwarder(
    queue: WeakMessageQueue<StoreInner>,
    mut rx: broadcast::Receiver<ContainerNotification>,
    writer_id: Uuid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match rx.recv().await {
                Ok(note) if note.writer == writer_id => continue,
                Ok(note) => note.message,
                Err(RecvError::Lagged(skipped)) => {
                    // Missed changes: forward the whole model instead.
                    warn!(skipped, "container notifications lagged");
                    let Some(queue) = queue.upgrade() else { break };
                    let model = queue.handler().container.local_data().await;
                    ProxyMessage::ModelUpdate { model, id: None }
                }
                Err(RecvError::Closed) => break,
            };
            let Some(queue) = queue.upgrade() else { break };
            if let Err(err) = queue.submit(Message::new(Payload::FromContainer(message))) {
                warn!(error = %err, "failed to forward container notification");
            }
        }
    })
}

fn spawn_backing_forwarder(
    queue: WeakMessageQueue<StoreInner>,
    mut rx: broadcast::Receiver<BackingNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let note = match rx.recv().await {
                Ok(note) => note,
                Err(RecvError::Lagged(skipped)) => {
                    // Missed releases: check every hold against the store.
                    warn!(skipped, "backing notifications lagged");
                    let Some(queue) = queue.upgrade() else { break };
                    queue.handler().recheck_holds().await;
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(queue) = queue.upgrade() else { break };
            let payload = Payload::FromBackingStore {
                message: note.message,
                mux_id: note.mux_id,
            };
            if let Err(err) = queue.submit(Message::new(payload)) {
                warn!(error = %err, "failed to forward backing notification");
            }
        }
    })
}

/// Who an outgoing message goes to.
#[derive(Clone, Copy, Debug)]
enum Recipient {
    One(ProxyId),
    All,
    AllExcept(Option<ProxyId>),
}

impl Recipient {
    fn includes(self, proxy: ProxyId) -> bool {
        match self {
            Self::One(id) => id == proxy,
            Self::All => true,
            Self::AllExcept(except) => except != Some(proxy),
        }
    }
}

/// Outgoing message body; container-valued bodies are resolved against the
/// backing store when the message leaves the send queue.
enum Body {
    Ready(RefModeMessage),
    Model {
        container: ContainerData,
        id: Option<ProxyId>,
    },
    Operation(ContainerOp),
}

struct Outgoing {
    body: Body,
    to: Recipient,
    sent: Option<oneshot::Sender<()>>,
}

impl Outgoing {
    fn new(body: Body, to: Recipient) -> Self {
        Self {
            body,
            to,
            sent: None,
        }
    }
}

/// Resolves reference versions by writing the entity to the backing store.
struct WritingVersionGetter<'a> {
    backing: &'a dyn BackingStore,
    actor: &'a Actor,
}

#[async_trait]
impl<'a> ItemVersionGetter for WritingVersionGetter<'a> {
    async fn version_of(&self, entity: &RawEntity) -> RefModeResult<VersionMap> {
        self.backing.write(self.actor, entity).await
    }
}

struct StoreInner {
    config: StoreConfig,
    kind: StoreKind,
    storage_key: ReferenceModeStorageKey,
    actor: Actor,
    writer_id: Uuid,
    container: Arc<dyn ContainerStore>,
    backing: Arc<dyn BackingStore>,
    proxies: RwLock<BTreeMap<ProxyId, mpsc::UnboundedSender<RefModeMessage>>>,
    next_proxy_id: AtomicU32,
    send_queue: Mutex<SendQueue<Outgoing>>,
    queue: WeakMessageQueue<StoreInner>,
}

impl StoreInner {
    fn getter(&self) -> WritingVersionGetter<'_> {
        WritingVersionGetter {
            backing: self.backing.as_ref(),
            actor: &self.actor,
        }
    }

    fn backing_key(&self) -> &StorageKey {
        self.storage_key.backing_key()
    }

    async fn logical_model(&self, container: &ContainerData) -> RefModeStoreData {
        let mut entities = BTreeMap::new();
        for id in container.values().keys() {
            if let Some(record) = self.backing.get(id).await {
                entities.insert(id.clone(), record.entity);
            }
        }
        to_ref_mode_data(container, &entities)
    }

    /// A hold on `reference` if the backing store is behind it.
    async fn hold_for(&self, reference: &Reference) -> Option<Hold> {
        if reference.version.is_empty() {
            return None;
        }
        let stored = self.backing.version_of(&reference.id).await;
        (!stored.dominates(&reference.version))
            .then(|| Hold::new(reference.id.clone(), reference.version.clone()))
    }

    async fn pending_holds(&self, container: &ContainerData) -> Vec<Hold> {
        let mut holds = Vec::new();
        for entry in container.values().values() {
            holds.extend(self.hold_for(&entry.value).await);
        }
        holds
    }

    async fn send(&self, outgoing: Outgoing) {
        self.send_held(Vec::new(), outgoing).await;
    }

    /// Queue `outgoing` behind `holds`, returning its cancel token.
    async fn send_held(&self, holds: Vec<Hold>, outgoing: Outgoing) -> u64 {
        let mut send_queue = self.send_queue.lock().await;
        let (token, ready) = send_queue.enqueue_blocking(holds, outgoing);
        self.dispatch(ready).await;
        token
    }

    /// Entity `id` reached `version` in the backing store.
    async fn release(&self, id: &str, version: &VersionMap) {
        let mut send_queue = self.send_queue.lock().await;
        let ready = send_queue.notify(id, version);
        self.dispatch(ready).await;
    }

    /// Release every hold the backing store already satisfies.
    async fn recheck_holds(&self) {
        let mut send_queue = self.send_queue.lock().await;
        let mut ready = Vec::new();
        for id in send_queue.held_ids() {
            let version = self.backing.version_of(&id).await;
            ready.extend(send_queue.notify(&id, &version));
        }
        debug!(released = ready.len(), "rechecked held sends");
        self.dispatch(ready).await;
    }

    /// Deliver released messages. Callers hold the send queue lock, so
    /// deliveries never interleave.
    async fn dispatch(&self, ready: Vec<Outgoing>) {
        for outgoing in ready {
            match self.render(outgoing.body).await {
                Ok(message) => self.deliver(outgoing.to, message),
                Err(err) => warn!(error = %err, "dropping outgoing message"),
            }
            if let Some(sent) = outgoing.sent {
                let _ = sent.send(());
            }
        }
    }

    async fn render(&self, body: Body) -> RefModeResult<RefModeMessage> {
        match body {
            Body::Ready(message) => Ok(message),
            Body::Model { container, id } => Ok(ProxyMessage::ModelUpdate {
                model: self.logical_model(&container).await,
                id,
            }),
            Body::Operation(op) => {
                let entity = match op.reference() {
                    Some(reference) => self.backing.get(&reference.id).await.map(|r| r.entity),
                    None => None,
                };
                let bridged = container_op_to_bridging_op(&op, entity)?;
                Ok(ProxyMessage::Operations {
                    operations: vec![bridged.ref_mode_op()],
                    id: None,
                })
            }
        }
    }

    fn deliver(&self, to: Recipient, message: RefModeMessage) {
        let proxies = self.proxies.read().expect("lock poisoned");
        for (&proxy, sender) in proxies.iter() {
            if to.includes(proxy) && sender.send(message.clone()).is_err() {
                debug!(proxy, "proxy receiver dropped");
            }
        }
    }

    /// Blank the entities whose references were in `before` but are gone
    /// from the container now. References a clear did not dominate stay.
    async fn clear_removed(&self, before: &ContainerData) -> RefModeResult<()> {
        let after = self.container.local_data().await;
        for id in before.values().keys() {
            if !after.values().contains_key(id) {
                self.backing.clear(&self.actor, id).await?;
            }
        }
        Ok(())
    }

    async fn apply_proxy_operations(
        &self,
        operations: Vec<RefModeStoreOp>,
        id: Option<ProxyId>,
    ) -> RefModeResult<bool> {
        let getter = self.getter();
        let mut applied = Vec::with_capacity(operations.len());
        let mut accepted = true;
        for op in operations {
            let bridged = to_bridging_op(&op, self.backing_key(), &getter).await?;
            let before = match &bridged {
                BridgingOperation::ClearSet { .. } | BridgingOperation::ClearSingleton { .. } => {
                    Some(self.container.local_data().await)
                }
                _ => None,
            };
            let container_message = ProxyMessage::Operations {
                operations: vec![bridged.container_op()],
                id,
            };
            if !self
                .container
                .on_proxy_message(container_message, self.writer_id)
                .await?
            {
                debug!(proxy = ?id, op = ?op.clock(), "container rejected proxy operation");
                accepted = false;
                break;
            }
            match (&bridged, before) {
                (BridgingOperation::RemoveFromSet { entity_value, .. }, _) => {
                    self.backing.clear(&self.actor, &entity_value.id).await?;
                }
                (_, Some(before)) => self.clear_removed(&before).await?,
                _ => {}
            }
            applied.push(op);
        }
        if !applied.is_empty() {
            let echo = ProxyMessage::Operations {
                operations: applied,
                id,
            };
            self.send(Outgoing::new(Body::Ready(echo), Recipient::AllExcept(id)))
                .await;
        }
        Ok(accepted)
    }

    async fn answer_sync(&self, proxy: ProxyId) {
        let container = self.container.local_data().await;
        let holds = self.pending_holds(&container).await;
        let body = Body::Model {
            container,
            id: Some(proxy),
        };
        if holds.is_empty() {
            self.send(Outgoing::new(body, Recipient::One(proxy))).await;
            return;
        }

        debug!(proxy, held = holds.len(), "sync response waiting on backing store");
        let (sent, sent_rx) = oneshot::channel();
        let outgoing = Outgoing {
            body,
            to: Recipient::One(proxy),
            sent: Some(sent),
        };
        let token = self.send_held(holds, outgoing).await;
        let queue = self.queue.clone();
        let timeout = self.config.sync_timeout();
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, sent_rx).await.is_ok() {
                return;
            }
            if let Some(queue) = queue.upgrade() {
                queue.handler().recover_sync(proxy, token).await;
            }
        });
    }

    /// A sync response stayed blocked past the timeout: the container points
    /// at entities the backing store will never get. Clear it, stop waiting
    /// on anything still held, and retry the sync.
    async fn recover_sync(&self, proxy: ProxyId, token: u64) {
        {
            let mut send_queue = self.send_queue.lock().await;
            let Some(mut ready) = send_queue.cancel(token) else {
                return;
            };
            warn!(
                proxy,
                timeout_ms = self.config.sync_timeout_ms,
                "sync response timed out waiting on backing store, clearing container"
            );

            let container = self.container.local_data().await;
            let clock = container.version_map().clone();
            let actor = self.actor.clone();
            let clear = match self.kind {
                StoreKind::Collection => ContainerOp::Set(SetOperation::Clear { actor, clock }),
                StoreKind::Singleton => {
                    ContainerOp::Singleton(SingletonOperation::Clear { actor, clock })
                }
            };
            let message = ProxyMessage::Operations {
                operations: vec![clear],
                id: None,
            };
            match self.container.on_proxy_message(message, self.writer_id).await {
                Ok(true) => {}
                Ok(false) => warn!(proxy, "container rejected clear"),
                Err(err) => warn!(proxy, error = %err, "failed to clear container"),
            }

            ready.extend(send_queue.release_all());
            self.dispatch(ready).await;
        }

        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let retry = ProxyMessage::SyncRequest { id: Some(proxy) };
        if let Err(err) = queue.submit(Message::new(Payload::FromStorageProxy(retry))) {
            warn!(proxy, error = %err, "failed to retry sync request");
        }
    }
}

#[async_trait]
impl MessageHandler for StoreInner {
    async fn handle_proxy_message(&self, message: RefModeMessage) -> RefModeResult<bool> {
        match message {
            ProxyMessage::Operations { operations, id } => {
                self.apply_proxy_operations(operations, id).await
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let bridging = to_bridging_data(&model, self.backing_key(), &self.getter()).await?;
                let container_message = ProxyMessage::ModelUpdate {
                    model: bridging.container_data,
                    id,
                };
                self.container
                    .on_proxy_message(container_message, self.writer_id)
                    .await?;
                let echo = ProxyMessage::ModelUpdate { model, id };
                self.send(Outgoing::new(Body::Ready(echo), Recipient::AllExcept(id)))
                    .await;
                Ok(true)
            }
            ProxyMessage::SyncRequest { id } => {
                let proxy = id.ok_or(RefModeError::MissingProxyId)?;
                self.answer_sync(proxy).await;
                Ok(true)
            }
        }
    }

    async fn handle_container_message(&self, message: ContainerMessage) -> RefModeResult<bool> {
        match message {
            ProxyMessage::Operations { operations, .. } => {
                for op in operations {
                    // Fails now, not at delivery, for ops with no logical form.
                    container_op_to_bridging_op(&op, None)?;
                    let hold = match &op {
                        ContainerOp::Set(SetOperation::Add { added, .. }) => {
                            self.hold_for(added).await
                        }
                        ContainerOp::Singleton(SingletonOperation::Update { value, .. }) => {
                            self.hold_for(value).await
                        }
                        _ => None,
                    };
                    let outgoing = Outgoing::new(Body::Operation(op), Recipient::All);
                    self.send_held(hold.into_iter().collect(), outgoing).await;
                }
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, .. } => {
                let holds = self.pending_holds(&model).await;
                let body = Body::Model {
                    container: model,
                    id: None,
                };
                self.send_held(holds, Outgoing::new(body, Recipient::All)).await;
                Ok(true)
            }
            ProxyMessage::SyncRequest { .. } => {
                let request = ProxyMessage::SyncRequest { id: None };
                self.send(Outgoing::new(Body::Ready(request), Recipient::All))
                    .await;
                Ok(true)
            }
        }
    }

    async fn handle_backing_message(
        &self,
        message: BackingMessage,
        mux_id: ReferenceId,
    ) -> RefModeResult<bool> {
        match message {
            ProxyMessage::ModelUpdate { model, .. } => {
                self.release(&mux_id, &model.version_map).await;
            }
            ProxyMessage::Operations { operations, .. } => {
                if let Some(last) = operations.last() {
                    self.release(&mux_id, last.clock()).await;
                }
            }
            ProxyMessage::SyncRequest { .. } => {
                return Err(RefModeError::UnexpectedSyncRequest("backing"));
            }
        }
        Ok(true)
    }
}
