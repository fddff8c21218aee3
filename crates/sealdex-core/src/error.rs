//! Typed errors with stable wire codes

use thiserror::Error;

/// Every failure surfaced across a crate boundary in sealdex.
///
/// Each variant maps to a stable wire code so the gateway and the client
/// agree on error identity without parsing human-readable messages.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Bearer token missing, unknown, or not the owner of the target client
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to change HE context or LSH shape after embeddings exist
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    #[error("duplicate external id: {0}")]
    DuplicateExternalId(String),

    #[error("embedding quota exceeded (limit {0})")]
    QuotaExceeded(u64),

    #[error("corrupt ciphertext: {0}")]
    CorruptCiphertext(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Malformed request parameters (wrong hash count, top_k out of range, bad base64)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Client-side fail-closed abort: outbound metadata still carried plaintext
    #[error("plaintext leak blocked: {0}")]
    PlaintextLeak(String),

    #[error("rate limited")]
    RateLimited,

    /// Could not reach the server (client side only)
    #[error("network error: {0}")]
    Network(String),

    /// Connection-level storage error; retried internally, never surfaced raw
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SearchError {
    /// Stable machine-readable code carried in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::Unauthenticated => "unauthenticated",
            SearchError::NotFound(_) => "not_found",
            SearchError::ConfigConflict(_) => "config_conflict",
            SearchError::DuplicateExternalId(_) => "duplicate_external_id",
            SearchError::QuotaExceeded(_) => "quota_exceeded",
            SearchError::CorruptCiphertext(_) => "corrupt_ciphertext",
            SearchError::Timeout(_) => "timeout",
            SearchError::InvalidRequest(_) => "invalid_request",
            SearchError::PlaintextLeak(_) => "plaintext_leak",
            SearchError::RateLimited => "rate_limited",
            SearchError::Network(_) => "network",
            SearchError::Transient(_) | SearchError::Internal(_) => "internal",
        }
    }

    /// Rebuild a typed error from a wire code + message (client side).
    pub fn from_wire(code: &str, message: &str) -> Self {
        match code {
            "unauthenticated" => SearchError::Unauthenticated,
            "not_found" => SearchError::NotFound(message.to_string()),
            "config_conflict" => SearchError::ConfigConflict(message.to_string()),
            "duplicate_external_id" => SearchError::DuplicateExternalId(message.to_string()),
            "quota_exceeded" => SearchError::QuotaExceeded(0),
            "corrupt_ciphertext" => SearchError::CorruptCiphertext(message.to_string()),
            "timeout" => SearchError::Timeout(0),
            "invalid_request" => SearchError::InvalidRequest(message.to_string()),
            "rate_limited" => SearchError::RateLimited,
            _ => SearchError::Internal(message.to_string()),
        }
    }
}
