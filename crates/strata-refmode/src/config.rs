use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RefModeResult;

/// Tunables for a [`ReferenceModeStore`](crate::ReferenceModeStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a sync request may wait on the backing store before the
    /// container is treated as corrupt and cleared, in milliseconds.
    pub sync_timeout_ms: u64,
    /// Capacity of the in-memory stores' notification channels.
    pub notification_capacity: usize,
    /// Prefix of the store's randomly generated actor.
    pub actor_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 30_000,
            notification_capacity: 1024,
            actor_prefix: "refmode".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Parse a config from TOML. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> RefModeResult<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert_eq!(c.sync_timeout(), Duration::from_secs(30));
        assert_eq!(c.notification_capacity, 1024);
        assert_eq!(c.actor_prefix, "refmode");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = StoreConfig::from_toml_str("sync_timeout_ms = 250\n").unwrap();
        assert_eq!(c.sync_timeout(), Duration::from_millis(250));
        assert_eq!(c.notification_capacity, 1024);
    }

    #[test]
    fn full_toml() {
        let c = StoreConfig::from_toml_str(
            "sync_timeout_ms = 10\nnotification_capacity = 8\nactor_prefix = \"edge\"\n",
        )
        .unwrap();
        assert_eq!(c.notification_capacity, 8);
        assert_eq!(c.actor_prefix, "edge");
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = StoreConfig::from_toml_str("sync_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, crate::error::RefModeError::Config(_)));
    }
}
