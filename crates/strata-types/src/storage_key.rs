//! Storage addresses.
//!
//! A [`StorageKey`] is written `protocol://location`. A
//! [`ReferenceModeStorageKey`] pairs the address of a backing (content) store
//! with the address of a structure store, written as
//! `reference-mode://{backing}{storage}` where each embedded key doubles any
//! literal `{` or `}` it contains.

use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Protocol name of reference-mode storage keys.
pub const REFERENCE_MODE_PROTOCOL: &str = "reference-mode";

const PROTOCOL_SEPARATOR: &str = "://";

/// Address of a single store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey {
    protocol: String,
    location: String,
}

impl StorageKey {
    /// Create a storage key, validating the protocol name.
    ///
    /// Protocols are non-empty and consist of lowercase ASCII letters, digits
    /// and `-`.
    pub fn new(
        protocol: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Self, TypeError> {
        let protocol = protocol.into();
        let location = location.into();
        validate_protocol(&protocol).map_err(|reason| TypeError::InvalidStorageKey {
            key: format!("{protocol}{PROTOCOL_SEPARATOR}{location}"),
            reason,
        })?;
        Ok(Self { protocol, location })
    }

    /// Parse a `protocol://location` string.
    pub fn parse(key: &str) -> Result<Self, TypeError> {
        let (protocol, location) =
            key.split_once(PROTOCOL_SEPARATOR)
                .ok_or_else(|| TypeError::InvalidStorageKey {
                    key: key.to_string(),
                    reason: "missing '://' separator".into(),
                })?;
        Self::new(protocol, location)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// A key addressing a child of this location.
    pub fn child_with_component(&self, component: &str) -> Self {
        let location = if self.location.is_empty() {
            component.to_string()
        } else {
            format!("{}/{component}", self.location.trim_end_matches('/'))
        };
        Self {
            protocol: self.protocol.clone(),
            location,
        }
    }

    /// This key, escaped for embedding inside another key.
    pub fn embed(&self) -> String {
        self.to_string().replace('{', "{{").replace('}', "}}")
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({self})")
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{PROTOCOL_SEPARATOR}{}", self.protocol, self.location)
    }
}

impl FromStr for StorageKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_protocol(protocol: &str) -> Result<(), String> {
    if protocol.is_empty() {
        return Err("protocol must not be empty".into());
    }
    if let Some(ch) = protocol
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(format!("protocol contains forbidden character: {ch:?}"));
    }
    Ok(())
}

/// Address of a reference-mode store: a backing (content) store holding whole
/// records plus a structure store holding references to them.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceModeStorageKey {
    backing_key: StorageKey,
    storage_key: StorageKey,
}

impl ReferenceModeStorageKey {
    /// Pair a backing key with a structure key.
    ///
    /// Both keys must use the same protocol.
    pub fn new(backing_key: StorageKey, storage_key: StorageKey) -> Result<Self, TypeError> {
        if backing_key.protocol() != storage_key.protocol() {
            return Err(TypeError::ProtocolMismatch {
                backing: backing_key.protocol().to_string(),
                storage: storage_key.protocol().to_string(),
            });
        }
        Ok(Self {
            backing_key,
            storage_key,
        })
    }

    /// Parse `reference-mode://{backing}{storage}`.
    pub fn parse(key: &str) -> Result<Self, TypeError> {
        let outer = StorageKey::parse(key)?;
        if outer.protocol() != REFERENCE_MODE_PROTOCOL {
            return Err(TypeError::InvalidStorageKey {
                key: key.to_string(),
                reason: format!("expected protocol {REFERENCE_MODE_PROTOCOL:?}"),
            });
        }
        let embedded = extract_embedded_keys(outer.location()).map_err(|reason| {
            TypeError::InvalidStorageKey {
                key: key.to_string(),
                reason,
            }
        })?;
        if embedded.len() != 2 {
            return Err(TypeError::EmbeddedKeyCount {
                key: key.to_string(),
                found: embedded.len(),
            });
        }
        let backing_key = StorageKey::parse(&embedded[0])?;
        let storage_key = StorageKey::parse(&embedded[1])?;
        Self::new(backing_key, storage_key)
    }

    /// Key of the store holding whole records.
    pub fn backing_key(&self) -> &StorageKey {
        &self.backing_key
    }

    /// Key of the store holding references.
    pub fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    /// A key whose structure store is a child of this one; the backing store
    /// is shared.
    pub fn child_with_component(&self, component: &str) -> Self {
        Self {
            backing_key: self.backing_key.clone(),
            storage_key: self.storage_key.child_with_component(component),
        }
    }
}

impl fmt::Debug for ReferenceModeStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceModeStorageKey({self})")
    }
}

impl fmt::Display for ReferenceModeStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{REFERENCE_MODE_PROTOCOL}{PROTOCOL_SEPARATOR}{{{}}}{{{}}}",
            self.backing_key.embed(),
            self.storage_key.embed()
        )
    }
}

impl FromStr for ReferenceModeStorageKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split `{a}{b}...` into its unescaped components.
fn extract_embedded_keys(body: &str) -> Result<Vec<String>, String> {
    let mut chars = body.chars().peekable();
    let mut keys = Vec::new();
    while let Some(ch) = chars.next() {
        if ch != '{' {
            return Err(format!("unexpected character {ch:?} outside an embedded key"));
        }
        keys.push(read_embedded_key(&mut chars)?);
    }
    Ok(keys)
}

fn read_embedded_key(chars: &mut Peekable<Chars<'_>>) -> Result<String, String> {
    let mut key = String::new();
    loop {
        match chars.next() {
            None => return Err("unterminated embedded key".into()),
            Some('{') => {
                if chars.next_if_eq(&'{').is_none() {
                    return Err("unescaped '{' inside an embedded key".into());
                }
                key.push('{');
            }
            Some('}') => {
                if chars.next_if_eq(&'}').is_none() {
                    return Ok(key);
                }
                key.push('}');
            }
            Some(other) => key.push(other),
        }
    }
}
