//! Pipeline configuration

use serde::Deserialize;

/// Tuning knobs for the aggregation pipeline and dispatcher. All fields
/// have working defaults; the daemon overlays values from its config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum accepted batch payload size in bytes; larger payloads are
    /// treated as invalid, not retried.
    pub max_payload_size: usize,
    /// Retry backoff for transient failures.
    pub retry: RetryConfig,
    /// How long a topic may wait on a missing dependency before a warning
    /// is logged. Nothing is dropped or reordered either way.
    pub topic_stall_timeout_ms: u64,
    /// Number of dispatcher workers; topics are sharded across them.
    pub dispatcher_shards: usize,
    /// Page size when scanning newly persisted pins.
    pub poll_page_size: usize,
    /// Interval between dispatcher sweeps when nothing pokes it.
    pub poll_interval_ms: u64,
    /// Bound of the intake and shard channels.
    pub channel_bound: usize,
    /// Entries kept in the message-data cache.
    pub data_cache_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 16 * 1024 * 1024,
            retry: RetryConfig::default(),
            topic_stall_timeout_ms: 60_000,
            dispatcher_shards: 4,
            poll_page_size: 50,
            poll_interval_ms: 2_000,
            channel_bound: 64,
            data_cache_entries: 512,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { initial_delay_ms: 250, max_delay_ms: 30_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: CoreConfig = toml_like(r#"{"max_payload_size": 1024}"#);
        assert_eq!(cfg.max_payload_size, 1024);
        assert_eq!(cfg.dispatcher_shards, CoreConfig::default().dispatcher_shards);
        assert_eq!(cfg.retry.initial_delay_ms, RetryConfig::default().initial_delay_ms);
    }

    fn toml_like(json: &str) -> CoreConfig {
        serde_json::from_str(json).unwrap()
    }
}
