use strata_types::Actor;
use thiserror::Error;

/// Unrecoverable CRDT failures.
///
/// These signal a corrupted or misused history. Ordinary ordering races are
/// reported as `Ok(false)` from `apply_operation` instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrdtError {
    /// Two replicas recorded different values for an actor at versions that
    /// cannot be ordered.
    #[error(
        "divergent versions for actor {actor}: local value {local_value}@{local_version}, \
         remote value {remote_value}@{remote_version}"
    )]
    DivergentVersions {
        actor: Actor,
        local_value: u64,
        local_version: u64,
        remote_value: u64,
        remote_version: u64,
    },

    /// A replica advanced an actor's version without recording a value.
    #[error("model has version but no value for actor {0}")]
    VersionWithoutValue(Actor),

    /// An operation names no actor, so it cannot advance any version.
    #[error("CRDT operation must name an actor")]
    EmptyActor,

    /// A value was submitted without an id.
    #[error("CRDT value must have an id")]
    MissingId,

    /// A message or operation targets a different CRDT kind.
    #[error("wrong CRDT kind: store manages a {expected}, received a {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },
}

/// Result alias for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

pub(crate) fn check_actor(actor: &Actor) -> CrdtResult<()> {
    if actor.as_str().is_empty() {
        return Err(CrdtError::EmptyActor);
    }
    Ok(())
}
