use strata_crdt::CrdtError;
use strata_types::TypeError;
use uuid::Uuid;

/// Errors from the reference-mode layer.
#[derive(Debug, thiserror::Error)]
pub enum RefModeError {
    /// A CRDT model rejected a message as corrupt or mis-typed.
    #[error(transparent)]
    Crdt(#[from] CrdtError),

    /// A storage key or actor was malformed.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// A merge result expressed as a fast-forward has no logical equivalent.
    #[error("cannot bridge a {0} fast-forward into a logical operation")]
    UnsupportedFastForward(&'static str),

    /// The same message was enqueued twice.
    #[error("message {0} is already enqueued")]
    AlreadyEnqueued(Uuid),

    /// The queue was dropped before the message was handled.
    #[error("message queue closed before {0} was handled")]
    QueueClosed(Uuid),

    /// Sync requests are only meaningful from storage proxies.
    #[error("unexpected sync request from the {0} store")]
    UnexpectedSyncRequest(&'static str),

    /// A sync request must name the proxy to answer.
    #[error("sync request without a proxy id")]
    MissingProxyId,

    /// A collaborator store is not addressed by the expected key.
    #[error("{store} store is addressed by {found}, expected {expected}")]
    KeyMismatch {
        store: &'static str,
        expected: String,
        found: String,
    },

    /// Configuration could not be parsed.
    #[error("invalid store config: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result alias for reference-mode operations.
pub type RefModeResult<T> = Result<T, RefModeError>;
