//! Per-store mailbox serializing messages from three producers.
//!
//! Storage proxies, the container store and the backing store all deliver
//! messages through one [`MessageQueue`]. Each [`MessageQueue::submit`]
//! appends to a shared buffer and spawns a drain task. A drain takes the
//! whole buffer and runs every captured message through the
//! [`MessageHandler`] in append order, completing each caller's future with
//! the handler's result.
//!
//! Drains run one at a time, so messages are handled in global append order,
//! not only within a batch. A handler must therefore never wait on another
//! message of the same queue.

use std::collections::{HashSet, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use strata_types::ReferenceId;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backing::BackingMessage;
use crate::error::{RefModeError, RefModeResult};
use crate::message::{ContainerMessage, RefModeMessage};

/// Origin-specific handlers run by a [`MessageQueue`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_proxy_message(&self, message: RefModeMessage) -> RefModeResult<bool>;

    async fn handle_container_message(&self, message: ContainerMessage) -> RefModeResult<bool>;

    async fn handle_backing_message(
        &self,
        message: BackingMessage,
        mux_id: ReferenceId,
    ) -> RefModeResult<bool>;
}

/// Where a message came from, and what it carries.
#[derive(Clone, Debug)]
pub enum Payload {
    FromStorageProxy(RefModeMessage),
    FromContainer(ContainerMessage),
    FromBackingStore {
        message: BackingMessage,
        mux_id: ReferenceId,
    },
}

impl Payload {
    pub fn origin(&self) -> &'static str {
        match self {
            Self::FromStorageProxy(_) => "proxy",
            Self::FromContainer(_) => "container",
            Self::FromBackingStore { .. } => "backing",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub id: Uuid,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
        }
    }
}

struct Enqueued {
    message: Message,
    done: oneshot::Sender<RefModeResult<bool>>,
}

#[derive(Default)]
struct State {
    buffer: Vec<Enqueued>,
    in_flight: HashSet<Uuid>,
}

struct Shared<H> {
    handler: H,
    state: Mutex<State>,
    drain_gate: tokio::sync::Mutex<()>,
    idle: Notify,
}

/// Ordered mailbox in front of a [`MessageHandler`].
pub struct MessageQueue<H> {
    shared: Arc<Shared<H>>,
}

impl<H> Clone for MessageQueue<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Non-owning handle to a [`MessageQueue`], for handlers and background
/// tasks that must not keep the queue alive.
pub struct WeakMessageQueue<H> {
    shared: Weak<Shared<H>>,
}

impl<H> Clone for WeakMessageQueue<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<H> WeakMessageQueue<H> {
    pub fn upgrade(&self) -> Option<MessageQueue<H>> {
        self.shared.upgrade().map(|shared| MessageQueue { shared })
    }
}

impl<H: MessageHandler> MessageQueue<H> {
    pub fn new(handler: H) -> Self {
        Self::new_cyclic(|_| handler)
    }

    /// Build a queue whose handler holds a weak handle back to it.
    pub fn new_cyclic(build: impl FnOnce(WeakMessageQueue<H>) -> H) -> Self {
        let shared = Arc::new_cyclic(|weak| Shared {
            handler: build(WeakMessageQueue {
                shared: Weak::clone(weak),
            }),
            state: Mutex::new(State::default()),
            drain_gate: tokio::sync::Mutex::new(()),
            idle: Notify::new(),
        });
        Self { shared }
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    pub fn downgrade(&self) -> WeakMessageQueue<H> {
        WeakMessageQueue {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Append `message` and schedule a drain, without waiting for it.
    ///
    /// The returned receiver resolves with the handler's result. Submitting
    /// a message whose id is still queued fails with
    /// [`RefModeError::AlreadyEnqueued`].
    pub fn submit(
        &self,
        message: Message,
    ) -> RefModeResult<oneshot::Receiver<RefModeResult<bool>>> {
        let (done, receiver) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if !state.in_flight.insert(message.id) {
                return Err(RefModeError::AlreadyEnqueued(message.id));
            }
            state.buffer.push(Enqueued { message, done });
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.drain().await });
        Ok(receiver)
    }

    /// Append `message` and wait for its handler to finish.
    pub async fn enqueue(&self, message: Message) -> RefModeResult<bool> {
        let id = message.id;
        let receiver = self.submit(message)?;
        receiver.await.map_err(|_| RefModeError::QueueClosed(id))?
    }

    /// Messages submitted but not yet handled.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().expect("lock poisoned").in_flight.len()
    }

    /// Wait until every submitted message has been handled.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Ids of a drained batch that are still in flight.
///
/// Dropping the guard retires every id it still holds, so a panicking
/// handler cannot leave [`MessageQueue::idle`] waiting forever.
struct InFlight<'a> {
    state: &'a Mutex<State>,
    idle: &'a Notify,
    ids: VecDeque<Uuid>,
}

impl InFlight<'_> {
    /// Retire the oldest id of the batch.
    fn finish_next(&mut self) {
        if let Some(id) = self.ids.pop_front() {
            self.retire([id]);
        }
    }

    fn retire(&self, ids: impl IntoIterator<Item = Uuid>) {
        let idle = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            for id in ids {
                state.in_flight.remove(&id);
            }
            state.in_flight.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        warn!(abandoned = self.ids.len(), "drain stopped before finishing its batch");
        let ids = mem::take(&mut self.ids);
        self.retire(ids);
    }
}

impl<H: MessageHandler> Shared<H> {
    async fn drain(&self) {
        let _gate = self.drain_gate.lock().await;
        let batch = mem::take(&mut self.state.lock().expect("lock poisoned").buffer);
        if batch.is_empty() {
            return;
        }
        debug!(messages = batch.len(), "draining message queue");

        let mut in_flight = InFlight {
            state: &self.state,
            idle: &self.idle,
            ids: batch.iter().map(|enqueued| enqueued.message.id).collect(),
        };
        for Enqueued { message, done } in batch {
            let Message { id, payload } = message;
            let origin = payload.origin();
            let result = match payload {
                Payload::FromStorageProxy(message) => {
                    self.handler.handle_proxy_message(message).await
                }
                Payload::FromContainer(message) => {
                    self.handler.handle_container_message(message).await
                }
                Payload::FromBackingStore { message, mux_id } => {
                    self.handler.handle_backing_message(message, mux_id).await
                }
            };
            if let Err(err) = &result {
                warn!(%id, origin, error = %err, "message handler failed");
            }
            if done.send(result).is_err() {
                debug!(%id, origin, "message result dropped by caller");
            }
            in_flight.finish_next();
        }
    }
}
