//! # Connection Configuration
//!
//! Purpose: Hold every knob the connection core reads, and derive the stable key
//! the registry uses to share one connection per logical configuration.
//!
//! ## Design Principles
//! 1. **Plain Data**: Public fields plus `Default`, like the rest of the client.
//! 2. **Serde Friendly**: Durations are expressed in milliseconds when loaded from
//!    JSON so configs stay human-editable.
//! 3. **Deterministic Backoff**: `pause_time` is a pure table lookup; no jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Idle window after which an unused coordinator link or stub is reclaimed.
pub const KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Period of the background sweep that reclaims idle coordinator resources.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Multipliers applied to the base pause for successive retries.
pub const RETRY_BACKOFF: [u32; 13] = [1, 2, 3, 5, 10, 20, 40, 100, 100, 100, 100, 200, 200];

/// Settings for one `CoreConnection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Coordinator ensemble, e.g. "zk1:2181,zk2:2181".
    pub quorum: String,
    /// Root path of this cluster inside the coordinator namespace.
    pub root_path: String,
    /// Base pause between retries.
    #[serde(with = "duration_ms")]
    pub pause: Duration,
    /// Attempts per operation; 1 disables retries.
    pub retries: u32,
    /// Deadline for a single RPC.
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
    /// Partitions read ahead from the metadata table on a cache miss.
    pub prefetch_limit: usize,
    /// Use per-server error tracking for batch backoff instead of flat pauses.
    pub retries_by_server: bool,
    /// Upper bound of cached locations per table; 0 means unbounded.
    pub location_cache_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            quorum: "localhost:2181".to_string(),
            root_path: "/rkv".to_string(),
            pause: Duration::from_millis(100),
            retries: 10,
            rpc_timeout: Duration::from_secs(60),
            prefetch_limit: 10,
            retries_by_server: true,
            location_cache_capacity: 0,
        }
    }
}

impl ConnectionConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(input: &str) -> Result<Self> {
        let config: ConnectionConfig = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the connection core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.quorum.trim().is_empty() {
            return Err(ClientError::InvalidArgument("quorum must not be empty".into()));
        }
        if self.retries == 0 {
            return Err(ClientError::InvalidArgument("retries must be at least 1".into()));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ClientError::InvalidArgument("rpc_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Returns the registry key identifying this configuration.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            quorum: self.quorum.clone(),
            root_path: self.root_path.clone(),
            pause: self.pause,
            retries: self.retries,
            rpc_timeout: self.rpc_timeout,
            prefetch_limit: self.prefetch_limit,
            retries_by_server: self.retries_by_server,
            location_cache_capacity: self.location_cache_capacity,
        }
    }

    /// Total time budget a batch may spend retrying against failing servers.
    ///
    /// Equal to what `retries` attempts would take under flat incremental
    /// backoff; zero when per-server tracking is disabled.
    pub fn retry_deadline_budget(&self) -> Duration {
        if !self.retries_by_server {
            return Duration::ZERO;
        }
        (0..self.retries).map(|i| pause_time(self.pause, i)).sum()
    }
}

/// Stable identity of a connection-relevant configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    quorum: String,
    root_path: String,
    pause: Duration,
    retries: u32,
    rpc_timeout: Duration,
    prefetch_limit: usize,
    retries_by_server: bool,
    location_cache_capacity: usize,
}

impl ConnectionKey {
    pub fn quorum(&self) -> &str {
        &self.quorum
    }
}

/// Pause before retry number `tries` (0-based).
pub fn pause_time(base: Duration, tries: u32) -> Duration {
    let idx = (tries as usize).min(RETRY_BACKOFF.len() - 1);
    base.saturating_mul(RETRY_BACKOFF[idx])
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_time_follows_table_and_saturates() {
        let base = Duration::from_millis(100);
        assert_eq!(pause_time(base, 0), Duration::from_millis(100));
        assert_eq!(pause_time(base, 3), Duration::from_millis(500));
        assert_eq!(pause_time(base, 12), Duration::from_millis(20_000));
        assert_eq!(pause_time(base, 50), Duration::from_millis(20_000));
    }

    #[test]
    fn deadline_budget_sums_pauses() {
        let mut config = ConnectionConfig {
            pause: Duration::from_millis(10),
            retries: 4,
            ..ConnectionConfig::default()
        };
        // 1 + 2 + 3 + 5
        assert_eq!(config.retry_deadline_budget(), Duration::from_millis(110));

        config.retries_by_server = false;
        assert_eq!(config.retry_deadline_budget(), Duration::ZERO);
    }

    #[test]
    fn json_uses_defaults_for_missing_fields() {
        let config =
            ConnectionConfig::from_json(r#"{"quorum":"zk1:2181","pause":50}"#).expect("parse");
        assert_eq!(config.quorum, "zk1:2181");
        assert_eq!(config.pause, Duration::from_millis(50));
        assert_eq!(config.retries, 10);
        assert!(config.retries_by_server);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = ConnectionConfig::from_json(r#"{"retries":0}"#).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = ConnectionConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn keys_differ_by_relevant_fields() {
        let a = ConnectionConfig::default();
        let mut b = a.clone();
        assert_eq!(a.key(), b.key());
        b.root_path = "/other".into();
        assert_ne!(a.key(), b.key());
    }
}
