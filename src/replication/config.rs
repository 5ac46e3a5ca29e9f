//! Mesh Configuration
//!
//! Timing and capacity knobs for a mesh node.

use crate::domain::identity::DEFAULT_PEER_PREFIX;
use std::time::Duration;

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Identity (e-mail) of the local user; the node id is derived from it
    pub identity: String,

    /// Name shown to other peers (default: the identity)
    pub display_name: String,

    /// Prefix of derived peer ids (default: "oae")
    pub peer_prefix: String,

    /// Upper bound for an outbound dial (default: 10s)
    pub connect_timeout: Duration,

    /// Delay between the initial state push and the `sync_request` pull (default: 800ms)
    pub bootstrap_delay: Duration,

    /// Delay before asking a new peer for its works and flushing pending ones (default: 1200ms)
    pub catchup_delay: Duration,

    /// Period of the known-peer reconnect loop (default: 30s)
    pub reconnect_interval: Duration,

    /// Period of the pending work flush loop (default: 15s)
    pub flush_interval: Duration,

    /// Maximum queued work broadcasts (default: 200)
    pub pending_capacity: usize,

    /// Capacity of the event channel (default: 1024)
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            display_name: String::new(),
            peer_prefix: DEFAULT_PEER_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(10),
            bootstrap_delay: Duration::from_millis(800),
            catchup_delay: Duration::from_millis(1200),
            reconnect_interval: Duration::from_secs(30),
            flush_interval: Duration::from_secs(15),
            pending_capacity: 200,
            event_capacity: 1024,
        }
    }
}

impl MeshConfig {
    /// Create a new configuration for an identity.
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            display_name: identity.clone(),
            identity,
            ..Default::default()
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn peer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.peer_prefix = prefix.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn bootstrap_delay(mut self, delay: Duration) -> Self {
        self.bootstrap_delay = delay;
        self
    }

    pub fn catchup_delay(mut self, delay: Duration) -> Self {
        self.catchup_delay = delay;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.trim().is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.peer_prefix.is_empty() {
            return Err(ConfigError::MissingPeerPrefix);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("connect_timeout"));
        }
        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("reconnect_interval"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("flush_interval"));
        }
        if self.pending_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("identity is required")]
    MissingIdentity,
    #[error("peer_prefix is required")]
    MissingPeerPrefix,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("pending_capacity must be greater than zero")]
    ZeroCapacity,
    #[error("transport is bound to {actual}, expected {expected}")]
    TransportIdentity { expected: String, actual: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(config.identity.is_empty());
        assert_eq!(config.peer_prefix, "oae");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.bootstrap_delay, Duration::from_millis(800));
        assert_eq!(config.catchup_delay, Duration::from_millis(1200));
        assert_eq!(config.reconnect_interval, Duration::from_secs(30));
        assert_eq!(config.flush_interval, Duration::from_secs(15));
        assert_eq!(config.pending_capacity, 200);
    }

    #[test]
    fn test_builder_pattern() {
        let config = MeshConfig::new("inspector@example.com")
            .display_name("Inspector")
            .peer_prefix("test")
            .connect_timeout(Duration::from_secs(1))
            .pending_capacity(5);

        assert_eq!(config.identity, "inspector@example.com");
        assert_eq!(config.display_name, "Inspector");
        assert_eq!(config.peer_prefix, "test");
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.pending_capacity, 5);
    }

    #[test]
    fn test_display_name_defaults_to_identity() {
        let config = MeshConfig::new("a@x.com");
        assert_eq!(config.display_name, "a@x.com");
    }

    #[test]
    fn test_validate_missing_identity() {
        assert_eq!(
            MeshConfig::default().validate(),
            Err(ConfigError::MissingIdentity)
        );
        assert_eq!(
            MeshConfig::new("   ").validate(),
            Err(ConfigError::MissingIdentity)
        );
    }

    #[test]
    fn test_validate_zero_values() {
        let config = MeshConfig::new("a@x.com").connect_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("connect_timeout"))
        );

        let config = MeshConfig::new("a@x.com").pending_capacity(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));
    }

    #[test]
    fn test_validate_ok() {
        assert!(MeshConfig::new("a@x.com").validate().is_ok());
    }
}
