//! Relay configuration
//!
//! Loaded from a TOML file. Every field has a default, so the relay runs
//! without a configuration file as long as `server.crt` and `server.key`
//! exist in the working directory. Command-line flags override file values.

use crate::chat::error::{RelayError, RelayResult};
use crate::chat::handler::ConnectionLimits;
use crate::chat::message::LogRetention;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub tls: TlsSettings,
    pub delivery: DeliverySettings,
    pub log: LogSettings,
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    /// Registry capacity
    pub max_clients: usize,
    /// Read buffer size; one read is one message
    pub max_frame_size: usize,
    pub handshake_timeout_ms: u64,
    /// How long a graceful shutdown waits for handlers
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8080,
            max_clients: 100,
            max_frame_size: 4096,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Server identity material (PEM files)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("server.crt"),
            private_key: PathBuf::from("server.key"),
        }
    }
}

/// Fan-out tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Per-client queue; a client that falls this far behind is evicted
    pub outbound_queue_len: usize,
    pub write_timeout_ms: u64,
    /// Messages waiting for the broker before readers are slowed down
    pub broker_queue_len: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            outbound_queue_len: 64,
            write_timeout_ms: 5_000,
            broker_queue_len: 1_024,
        }
    }
}

/// Message log retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub max_entries: usize,
    /// Entries older than this are pruned (unset keeps them until evicted by size)
    pub max_age_secs: Option<u64>,
    /// JSON-lines file the log is drained into on graceful shutdown
    pub archive_path: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age_secs: None,
            archive_path: None,
        }
    }
}

impl LogSettings {
    pub fn retention(&self) -> LogRetention {
        LogRetention {
            max_entries: self.max_entries,
            max_age: self.max_age_secs.map(Duration::from_secs),
        }
    }

    /// How often expired entries are pruned
    pub fn cleanup_interval(&self) -> Duration {
        let age = self.max_age_secs.unwrap_or(30);
        Duration::from_secs(age.clamp(1, 30))
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> RelayResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> RelayResult<Self> {
        toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> RelayResult<()> {
        let checks = [
            (self.server.max_clients == 0, "server.max_clients must be at least 1"),
            (self.server.max_frame_size == 0, "server.max_frame_size must be at least 1"),
            (self.server.handshake_timeout_ms == 0, "server.handshake_timeout_ms must be positive"),
            (
                self.delivery.outbound_queue_len == 0,
                "delivery.outbound_queue_len must be at least 1",
            ),
            (self.delivery.write_timeout_ms == 0, "delivery.write_timeout_ms must be positive"),
            (self.delivery.broker_queue_len == 0, "delivery.broker_queue_len must be at least 1"),
            (self.log.max_entries == 0, "log.max_entries must be at least 1"),
            (self.log.max_age_secs == Some(0), "log.max_age_secs must be positive"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(RelayError::Config(reason.to_string())),
            None => Ok(()),
        }
    }

    /// `address:port` for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_frame_size: self.server.max_frame_size,
            outbound_queue_len: self.delivery.outbound_queue_len,
            write_timeout: Duration::from_millis(self.delivery.write_timeout_ms),
        }
    }
}
