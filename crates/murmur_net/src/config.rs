//! Node configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Default UDP port for beacons.
pub const DEFAULT_BEACON_PORT: u16 = 5670;

/// Configuration for a murmur node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name announced in HELLO. `None` uses the short form of the uuid.
    pub name: Option<String>,

    /// Whether LAN discovery (UDP broadcast beacons) is enabled.
    pub beacon_enabled: bool,

    /// UDP port beacons are sent to and received on.
    pub beacon_port: u16,

    /// Override for the beacon destination address. When unset the broadcast
    /// address of `interface` is used, or `255.255.255.255`.
    pub beacon_addr: Option<Ipv4Addr>,

    /// Network interface to use. Selects the broadcast address and the
    /// address the mailbox binds to.
    pub interface: Option<String>,

    /// Mailbox bind port. 0 picks an ephemeral port.
    pub port: u16,

    /// Period between beacons.
    #[serde(with = "duration_ms_serde")]
    pub beacon_interval: Duration,

    /// Silence after which a peer is considered evasive.
    #[serde(with = "duration_ms_serde")]
    pub evasive_timeout: Duration,

    /// Silence after which a peer is expired and removed.
    #[serde(with = "duration_ms_serde")]
    pub expired_timeout: Duration,

    /// Upper bound on opening an outbound mailbox connection.
    #[serde(with = "duration_ms_serde")]
    pub connect_timeout: Duration,

    /// Capacity of the engine → application event channel.
    pub event_capacity: usize,

    /// Capacity of the application → engine command channel.
    pub command_capacity: usize,

    /// Capacity of each peer's outbound frame queue.
    pub outbox_capacity: usize,

    /// Mailbox addresses greeted at startup, for networks without broadcast.
    pub known_peers: Vec<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            beacon_enabled: true,
            beacon_port: DEFAULT_BEACON_PORT,
            beacon_addr: None,
            interface: None,
            port: 0,
            beacon_interval: Duration::from_secs(1),
            evasive_timeout: Duration::from_secs(5),
            expired_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            event_capacity: 256,
            command_capacity: 64,
            outbox_capacity: 1024,
            known_peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Check the configuration before the engine starts.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.beacon_interval.is_zero() {
            return Err(NetworkError::Config("beacon_interval must be non-zero".into()));
        }
        if self.evasive_timeout.is_zero() {
            return Err(NetworkError::Config("evasive_timeout must be non-zero".into()));
        }
        if self.evasive_timeout >= self.expired_timeout {
            return Err(NetworkError::Config(format!(
                "evasive_timeout ({:?}) must be shorter than expired_timeout ({:?})",
                self.evasive_timeout, self.expired_timeout
            )));
        }
        if self.tick_interval().is_zero() {
            return Err(NetworkError::Config(format!(
                "evasive_timeout ({:?}) is too short to derive a tick period",
                self.evasive_timeout
            )));
        }
        if self.event_capacity == 0 || self.command_capacity == 0 || self.outbox_capacity == 0 {
            return Err(NetworkError::Config("channel capacities must be non-zero".into()));
        }
        if self.beacon_enabled && self.beacon_port == 0 {
            return Err(NetworkError::Config("beacon_port must be non-zero".into()));
        }
        Ok(())
    }

    /// Period of the engine's housekeeping tick.
    pub fn tick_interval(&self) -> Duration {
        self.beacon_interval.min(self.evasive_timeout / 4)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NodeConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.beacon_enabled);
        assert_eq!(config.beacon_port, 5670);
        assert_eq!(config.port, 0);
        assert_eq!(config.beacon_interval, Duration::from_secs(1));
        assert_eq!(config.evasive_timeout, Duration::from_secs(5));
        assert_eq!(config.expired_timeout, Duration::from_secs(30));
        assert!(config.known_peers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_ordering_rejected() {
        let config = NodeConfig {
            evasive_timeout: Duration::from_secs(30),
            expired_timeout: Duration::from_secs(5),
            ..NodeConfig::default()
        };
        match config.validate() {
            Err(NetworkError::Config(msg)) => assert!(msg.contains("evasive_timeout")),
            other => panic!("Expected Config error, got {other:?}"),
        }

        let equal = NodeConfig {
            evasive_timeout: Duration::from_secs(5),
            expired_timeout: Duration::from_secs(5),
            ..NodeConfig::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = NodeConfig {
            beacon_interval: Duration::ZERO,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            event_capacity: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_evasive_too_short_for_tick_rejected() {
        let config = NodeConfig {
            evasive_timeout: Duration::from_nanos(3),
            expired_timeout: Duration::from_secs(1),
            ..NodeConfig::default()
        };
        assert!(config.tick_interval().is_zero());
        assert!(matches!(config.validate(), Err(NetworkError::Config(_))));

        let config = NodeConfig {
            evasive_timeout: Duration::from_nanos(4),
            ..config
        };
        assert_eq!(config.tick_interval(), Duration::from_nanos(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tick_interval_is_sub_interval_of_evasive() {
        let config = NodeConfig {
            beacon_interval: Duration::from_millis(50),
            evasive_timeout: Duration::from_millis(200),
            expired_timeout: Duration::from_millis(1000),
            ..NodeConfig::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(50));

        let config = NodeConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(1000));

        let config = NodeConfig {
            beacon_interval: Duration::from_secs(10),
            ..NodeConfig::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(1250));
    }

    #[test]
    fn test_config_serialize_uses_millis() {
        let config = NodeConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["evasive_timeout"], 5000);
        let deserialized: NodeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized.expired_timeout, config.expired_timeout);
    }

    #[test]
    fn test_config_partial_json_fills_defaults() {
        let config: NodeConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.beacon_port, DEFAULT_BEACON_PORT);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let original = NodeConfig {
            port: 7777,
            known_peers: vec!["192.168.1.100:7777".parse().unwrap()],
            ..NodeConfig::default()
        };
        original.save_to_file(&path).unwrap();

        let loaded = NodeConfig::load_or_default(&path);
        assert_eq!(loaded.port, 7777);
        assert_eq!(loaded.known_peers.len(), 1);
    }

    #[test]
    fn test_config_load_missing_or_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(NodeConfig::load_or_default(&missing).beacon_port, DEFAULT_BEACON_PORT);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(NodeConfig::load_or_default(&corrupt).port, 0);
    }
}
