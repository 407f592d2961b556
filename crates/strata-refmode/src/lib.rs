//! Reference-mode storage for Strata.
//!
//! A reference-mode store keeps a logical collection (or singleton) of whole
//! entities as two separately replicated parts: a container store holding a
//! CRDT of lightweight [`Reference`]s, and a backing store holding the
//! entities themselves, addressed by id and versioned independently.
//!
//! # Layers
//!
//! - [`bridging`] -- translation between entity-valued and reference-valued
//!   models and operations
//! - [`MessageQueue`] -- per-store mailbox that orders messages from proxies,
//!   the container store and the backing store
//! - [`SendQueue`] -- outbound FIFO whose items wait on backing-store versions
//! - [`ReferenceModeStore`] -- the store proxies talk to
//!
//! # Collaborators
//!
//! - [`ContainerStore`] / [`InMemoryContainerStore`]
//! - [`BackingStore`] / [`InMemoryBackingStore`]
//!
//! # Design Rules
//!
//! 1. An entity is written to the backing store before any reference to it
//!    enters the container store.
//! 2. A proxy never receives a reference whose entity the backing store does
//!    not yet hold at the referenced version; the send waits instead.
//! 3. CRDT math stays synchronous. Version lookups happen in the bridging
//!    layer, before a container op is built.
//! 4. A merge result only expressible as a fast-forward cannot be bridged and
//!    fails with [`RefModeError::UnsupportedFastForward`].

pub mod backing;
pub mod bridging;
pub mod config;
pub mod container;
pub mod data;
pub mod entity;
pub mod error;
pub mod message;
pub mod queue;
pub mod send_queue;
pub mod store;

// Re-export primary types at crate root for ergonomic imports.
pub use backing::{
    BackingMessage, BackingNotification, BackingOp, BackingRecord, BackingStore,
    InMemoryBackingStore,
};
pub use bridging::{BridgingData, BridgingOperation, ItemVersionGetter};
pub use config::StoreConfig;
pub use container::{ContainerNotification, ContainerStore, InMemoryContainerStore};
pub use data::{
    ContainerData, ContainerOp, HasKind, RefModeStoreData, RefModeStoreOp, RefModeStoreOutput,
    StoreKind,
};
pub use entity::{FieldValue, RawEntity, Reference, UNINITIALIZED_TIMESTAMP};
pub use error::{RefModeError, RefModeResult};
pub use message::{ContainerMessage, ProxyId, ProxyMessage, RefModeMessage};
pub use queue::{Message, MessageHandler, MessageQueue, Payload, WeakMessageQueue};
pub use send_queue::{Hold, SendQueue};
pub use store::ReferenceModeStore;
