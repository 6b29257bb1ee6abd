//! Configuration for the collaboration layer.
//!
//! Every knob has a default; [`CollabConfig::from_env`] overrides them from
//! `COLLAB_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff for reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether dropped connections are retried at all.
    pub enabled: bool,
    /// Reconnection attempts before giving up (the initial connect is not counted).
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-indexed):
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Thresholds for splitting oversized domain messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Serialized size above which a message is chunked.
    pub max_message_bytes: usize,
    /// Size of each chunk's payload slice.
    pub chunk_size_bytes: usize,
    /// How long an incomplete chunk set is kept, in milliseconds.
    pub retention_ms: u64,
    /// Pause between consecutive chunk sends, in milliseconds.
    pub send_delay_ms: u64,
    /// Largest `total_chunks` accepted for one set, either direction.
    pub max_chunks: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 256 * 1024,
            chunk_size_bytes: 64 * 1024,
            retention_ms: 30_000,
            send_delay_ms: 10,
            max_chunks: 1_024,
        }
    }
}

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Deadline for opening the transport, in milliseconds.
    pub connect_timeout_ms: u64,
    /// How long `send` waits for an ACK, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Default deadline for request/response exchanges, in milliseconds.
    pub response_timeout_ms: u64,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Chunking thresholds.
    pub chunking: ChunkConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            response_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
            chunking: ChunkConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Connect deadline.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// ACK deadline.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Default response deadline.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Persistence batching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Quiet period before a batch is flushed, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 50 }
    }
}

impl BatchConfig {
    /// Debounce window.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// REST API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the REST API, e.g. `https://api.example.com/`.
    pub base_url: Option<String>,
    /// Per-request timeout, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl ApiConfig {
    /// Per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollabConfig {
    /// Connection manager.
    pub connection: ConnectionConfig,
    /// Persistence batching.
    pub batching: BatchConfig,
    /// REST API.
    pub api: ApiConfig,
    /// Undo/redo stack capacity.
    pub max_history: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            batching: BatchConfig::default(),
            api: ApiConfig::default(),
            max_history: diagram_core::DEFAULT_MAX_STACK_SIZE,
        }
    }
}

impl CollabConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Recognised variables: `COLLAB_API_URL`, `COLLAB_API_TIMEOUT_MS`,
    /// `COLLAB_CONNECT_TIMEOUT_MS`, `COLLAB_ACK_TIMEOUT_MS`,
    /// `COLLAB_RESPONSE_TIMEOUT_MS`, `COLLAB_RECONNECT`,
    /// `COLLAB_MAX_RECONNECT_ATTEMPTS`, `COLLAB_RECONNECT_BASE_DELAY_MS`,
    /// `COLLAB_RECONNECT_MAX_DELAY_MS`, `COLLAB_CHUNK_THRESHOLD_BYTES`,
    /// `COLLAB_CHUNK_SIZE_BYTES`, `COLLAB_CHUNK_RETENTION_MS`,
    /// `COLLAB_CHUNK_SEND_DELAY_MS`, `COLLAB_CHUNK_MAX_CHUNKS`, `COLLAB_DEBOUNCE_MS`, `COLLAB_MAX_HISTORY`.
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let conn = &mut config.connection;

        if let Some(url) = lookup("COLLAB_API_URL").filter(|u| !u.trim().is_empty()) {
            config.api.base_url = Some(url);
        }
        override_from(&lookup, "COLLAB_API_TIMEOUT_MS", &mut config.api.request_timeout_ms);
        override_from(&lookup, "COLLAB_CONNECT_TIMEOUT_MS", &mut conn.connect_timeout_ms);
        override_from(&lookup, "COLLAB_ACK_TIMEOUT_MS", &mut conn.ack_timeout_ms);
        override_from(&lookup, "COLLAB_RESPONSE_TIMEOUT_MS", &mut conn.response_timeout_ms);
        override_from(&lookup, "COLLAB_RECONNECT", &mut conn.reconnect.enabled);
        override_from(&lookup, "COLLAB_MAX_RECONNECT_ATTEMPTS", &mut conn.reconnect.max_attempts);
        override_from(&lookup, "COLLAB_RECONNECT_BASE_DELAY_MS", &mut conn.reconnect.base_delay_ms);
        override_from(&lookup, "COLLAB_RECONNECT_MAX_DELAY_MS", &mut conn.reconnect.max_delay_ms);
        override_from(&lookup, "COLLAB_CHUNK_THRESHOLD_BYTES", &mut conn.chunking.max_message_bytes);
        override_from(&lookup, "COLLAB_CHUNK_SIZE_BYTES", &mut conn.chunking.chunk_size_bytes);
        override_from(&lookup, "COLLAB_CHUNK_RETENTION_MS", &mut conn.chunking.retention_ms);
        override_from(&lookup, "COLLAB_CHUNK_SEND_DELAY_MS", &mut conn.chunking.send_delay_ms);
        override_from(&lookup, "COLLAB_CHUNK_MAX_CHUNKS", &mut conn.chunking.max_chunks);
        override_from(&lookup, "COLLAB_DEBOUNCE_MS", &mut config.batching.debounce_ms);
        override_from(&lookup, "COLLAB_MAX_HISTORY", &mut config.max_history);

        if config.max_history == 0 {
            config.max_history = diagram_core::DEFAULT_MAX_STACK_SIZE;
        }
        config
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::from_lookup(|_| None);
        assert_eq!(config.connection.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.reconnect.max_attempts, 5);
        assert_eq!(config.connection.chunking.max_message_bytes, 262_144);
        assert_eq!(config.connection.chunking.max_chunks, 1_024);
        assert_eq!(config.batching.debounce(), Duration::from_millis(50));
        assert_eq!(config.max_history, 50);
        assert!(config.api.base_url.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let reconnect = ReconnectConfig {
            enabled: true,
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(reconnect.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(reconnect.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(reconnect.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(reconnect.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(reconnect.delay_for_attempt(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("COLLAB_API_URL", "http://localhost:8080/"),
            ("COLLAB_ACK_TIMEOUT_MS", "250"),
            ("COLLAB_RECONNECT", "false"),
            ("COLLAB_DEBOUNCE_MS", "10"),
            ("COLLAB_CHUNK_MAX_CHUNKS", "64"),
            ("COLLAB_MAX_RECONNECT_ATTEMPTS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = CollabConfig::from_lookup(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.api.base_url.as_deref(), Some("http://localhost:8080/"));
        assert_eq!(config.connection.ack_timeout_ms, 250);
        assert!(!config.connection.reconnect.enabled);
        assert_eq!(config.batching.debounce_ms, 10);
        assert_eq!(config.connection.chunking.max_chunks, 64);
        assert_eq!(config.connection.reconnect.max_attempts, 5);
    }
}
