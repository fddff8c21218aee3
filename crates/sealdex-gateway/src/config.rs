//! Gateway configuration with environment overrides

use std::str::FromStr;

/// Server-side knobs. `from_env` reads the `SECURE_SEARCH_*` variables;
/// anything unset falls back to the defaults below.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub db_path: String,
    /// Keys the per-client LSH planes; must be stable across restarts
    pub server_secret: String,
    pub request_timeout_secs: u64,
    pub max_bucket_fanout: usize,
    /// Embedding quota applied to newly provisioned clients
    pub max_embeddings: u64,
    pub plane_cache_capacity: usize,
    pub rate_limit_per_minute: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8990".into(),
            db_path: "sealdex.db".into(),
            server_secret: "dev-only-secret".into(),
            request_timeout_secs: 30,
            max_bucket_fanout: 2048,
            max_embeddings: 1_000_000,
            plane_cache_capacity: 256,
            rate_limit_per_minute: 600,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env_string("SECURE_SEARCH_BIND", defaults.bind),
            db_path: env_string("SECURE_SEARCH_DB", defaults.db_path),
            server_secret: env_string("SECURE_SEARCH_SERVER_SECRET", defaults.server_secret),
            request_timeout_secs: env_parsed(
                "SECURE_SEARCH_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            max_bucket_fanout: env_parsed(
                "SECURE_SEARCH_MAX_BUCKET_FANOUT",
                defaults.max_bucket_fanout,
            ),
            max_embeddings: env_parsed("SECURE_SEARCH_MAX_EMBEDDINGS", defaults.max_embeddings),
            plane_cache_capacity: defaults.plane_cache_capacity,
            rate_limit_per_minute: env_parsed(
                "SECURE_SEARCH_RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            ),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
