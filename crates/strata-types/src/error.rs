use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid storage key {key:?}: {reason}")]
    InvalidStorageKey { key: String, reason: String },

    #[error("reference-mode key {key:?} must embed exactly two keys, found {found}")]
    EmbeddedKeyCount { key: String, found: usize },

    #[error("reference-mode keys use different protocols: backing={backing}, storage={storage}")]
    ProtocolMismatch { backing: String, storage: String },

    #[error("invalid actor: {0}")]
    InvalidActor(String),
}
