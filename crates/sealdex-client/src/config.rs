//! Client configuration from the environment

use std::time::Duration;

use sealdex_core::LshConfig;

/// Everything the pipeline needs before it talks to a server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub api_key: String,
    /// Fail-closed: strip `text` from metadata before upload and abort if
    /// any plaintext would still leave the process
    pub strip_plaintext_metadata: bool,
    pub embedding_dim: usize,
    pub lsh: LshConfig,
    pub scheme: String,
    pub poly_modulus_degree: u32,
    pub scale: i64,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8990".into(),
            api_key: String::new(),
            strip_plaintext_metadata: true,
            embedding_dim: 384,
            lsh: LshConfig::default(),
            scheme: "mock".into(),
            poly_modulus_degree: 8192,
            scale: 1 << 40,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Read the well-known `SECURE_SEARCH_*` variables. The bearer key
    /// also answers to the legacy `DB_SERVER_API_KEY` name.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("SECURE_SEARCH_SERVER_URL").unwrap_or(defaults.server_url),
            api_key: std::env::var("DB_SERVER_API_KEY")
                .or_else(|_| std::env::var("SECURE_SEARCH_API_KEY"))
                .unwrap_or(defaults.api_key),
            strip_plaintext_metadata: std::env::var("SECURE_SEARCH_STRIP_PLAINTEXT_METADATA")
                .map(|v| flag(&v))
                .unwrap_or(defaults.strip_plaintext_metadata),
            ..defaults
        }
    }
}

/// Corpus scale (in thousands) for the large synthetic tests.
pub fn corpus_thousands() -> usize {
    std::env::var("SECURE_SEARCH_THOUSANDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2)
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "yes")
}
