//! Environment-driven configuration for the link layer.
//!
//! Values are read once, at stream construction. Unset or unparsable
//! keys fall back to the defaults.

use serde::{Deserialize, Serialize};

/// Poller timeout granularity in seconds.
pub const DEFAULT_TIMEOUT_RESOLUTION: u64 = 15;
/// Wall-clock bound on a single connect attempt, in seconds.
pub const DEFAULT_CONNECTION_WINDOW: u64 = 120;
/// Connect attempts allowed per error episode.
pub const DEFAULT_CONNECTION_RETRY: u32 = 5;
/// Seconds during which a terminal stream error is sticky.
pub const DEFAULT_STREAM_ERROR_WINDOW: u64 = 1800;
/// Parallel sub-streams to bond on top of the primary stream.
pub const DEFAULT_MULTISTREAM_COUNT: u32 = 0;
/// Minimum chunk size when splitting reads across sub-streams.
pub const DEFAULT_MULTISTREAM_SPLIT_SIZE: u32 = 4 * 1024 * 1024;
/// Idle TTL toward data servers, in seconds.
pub const DEFAULT_DATA_SERVER_TTL: u64 = 300;
/// Idle TTL toward load balancers, in seconds.
pub const DEFAULT_LB_SERVER_TTL: u64 = 1200;

/// Link-layer configuration, read once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Granularity of poller read/write timeouts, in seconds.
    pub timeout_resolution_secs: u64,
    /// Wall-clock window for one connect attempt, in seconds.
    pub connection_window_secs: u64,
    /// Connect attempts allowed per error episode.
    pub connection_retry: u32,
    /// Window during which a stream in `Error` rejects traffic, in seconds.
    pub stream_error_window_secs: u64,
    /// Parallel sub-streams to bond.
    pub multistream_count: u32,
    /// Minimum read-split chunk size in bytes.
    pub multistream_split_size: u32,
    /// Idle TTL for data-server channels, in seconds.
    pub data_server_ttl_secs: u64,
    /// Idle TTL for load-balancer channels, in seconds.
    pub lb_server_ttl_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout_resolution_secs: DEFAULT_TIMEOUT_RESOLUTION,
            connection_window_secs: DEFAULT_CONNECTION_WINDOW,
            connection_retry: DEFAULT_CONNECTION_RETRY,
            stream_error_window_secs: DEFAULT_STREAM_ERROR_WINDOW,
            multistream_count: DEFAULT_MULTISTREAM_COUNT,
            multistream_split_size: DEFAULT_MULTISTREAM_SPLIT_SIZE,
            data_server_ttl_secs: DEFAULT_DATA_SERVER_TTL,
            lb_server_ttl_secs: DEFAULT_LB_SERVER_TTL,
        }
    }
}

impl LinkConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            timeout_resolution_secs: env_or("TimeoutResolution", DEFAULT_TIMEOUT_RESOLUTION),
            connection_window_secs: env_or("ConnectionWindow", DEFAULT_CONNECTION_WINDOW),
            connection_retry: env_or("ConnectionRetry", DEFAULT_CONNECTION_RETRY),
            stream_error_window_secs: env_or("StreamErrorWindow", DEFAULT_STREAM_ERROR_WINDOW),
            multistream_count: env_or("MULTISTREAMCNT", DEFAULT_MULTISTREAM_COUNT),
            multistream_split_size: env_or("MULTISTREAMSPLITSIZE", DEFAULT_MULTISTREAM_SPLIT_SIZE),
            data_server_ttl_secs: env_or("DataServerConn_ttl", DEFAULT_DATA_SERVER_TTL),
            lb_server_ttl_secs: env_or("LBServerConn_ttl", DEFAULT_LB_SERVER_TTL),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.timeout_resolution_secs, 15);
        assert_eq!(config.connection_window_secs, 120);
        assert_eq!(config.connection_retry, 5);
        assert_eq!(config.stream_error_window_secs, 1800);
        assert_eq!(config.multistream_split_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_env_override_and_fallback() {
        // Key scoped to this test; tests in this module run serially
        // enough for set/remove around a single read.
        std::env::set_var("ConnectionRetry", "9");
        let config = LinkConfig::from_env();
        assert_eq!(config.connection_retry, 9);
        std::env::set_var("ConnectionRetry", "not-a-number");
        let config = LinkConfig::from_env();
        assert_eq!(config.connection_retry, DEFAULT_CONNECTION_RETRY);
        std::env::remove_var("ConnectionRetry");
    }
}
