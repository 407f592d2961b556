use std::borrow::Borrow;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identifier of an item stored in a set or singleton.
///
/// Two items with the same `ReferenceId` are the same logical item, even when
/// their payloads differ.
pub type ReferenceId = String;

/// Anything that can be stored in a set or singleton CRDT.
pub trait Referencable {
    /// The stable identifier of this item.
    fn id(&self) -> &str;
}

impl Referencable for String {
    fn id(&self) -> &str {
        self
    }
}

/// A writer contributing to a version map.
///
/// Actors are compared lexicographically, which gives version maps a
/// deterministic iteration order. An actor must be non-empty.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    /// Create an actor from a name, rejecting empty names.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TypeError::InvalidActor("actor name must not be empty".into()));
        }
        Ok(Self(name))
    }

    /// Create a random actor, `{prefix}-{n}`, for synthesised writes.
    pub fn random(prefix: &str) -> Self {
        let n: u64 = rand::thread_rng().gen();
        Self(format!("{prefix}-{n:016x}"))
    }

    /// The actor name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Actor({})", self.0)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Actor {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Actor {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unchecked conversion for literals and already-validated names. Use
/// [`Actor::new`] for untrusted input; CRDT operations reject an empty actor.
impl From<&str> for Actor {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Unchecked, like the `&str` conversion.
impl From<String> for Actor {
    fn from(name: String) -> Self {
        Self(name)
    }
}
