//! JSON wire protocol shared by the gateway and the client
//!
//! Binary fields (ciphertexts, public keys, planes) travel as standard
//! base64 strings.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SearchError;
use crate::types::{HeContext, LshConfig};

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>, SearchError> {
    STANDARD
        .decode(s)
        .map_err(|e| SearchError::InvalidRequest(format!("invalid base64: {e}")))
}

/// Base64 decode for fields that carry ciphertext; failures are corruption,
/// not malformed requests.
pub fn decode_ciphertext_b64(s: &str) -> Result<Vec<u8>, SearchError> {
    STANDARD
        .decode(s)
        .map_err(|e| SearchError::CorruptCiphertext(format!("invalid base64: {e}")))
}

/// HE context descriptor as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextParams {
    pub public_key: String,
    pub scheme: String,
    pub poly_modulus_degree: u32,
    pub scale: i64,
}

impl ContextParams {
    pub fn to_context(&self) -> Result<HeContext, SearchError> {
        Ok(HeContext {
            scheme: self.scheme.clone(),
            poly_modulus_degree: self.poly_modulus_degree,
            scale: self.scale,
            public_key: decode_b64(&self.public_key)?,
        })
    }

    pub fn from_context(ctx: &HeContext) -> Self {
        Self {
            public_key: encode_b64(&ctx.public_key),
            scheme: ctx.scheme.clone(),
            poly_modulus_degree: ctx.poly_modulus_degree,
            scale: ctx.scale,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub context_params: ContextParams,
    pub embedding_dim: usize,
    pub lsh_config: LshConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub client_id: Uuid,
    pub lsh_config: LshConfig,
    pub random_planes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddEmbeddingRequest {
    pub client_id: Uuid,
    pub encrypted_embedding: String,
    pub lsh_hashes: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddEmbeddingResponse {
    pub embedding_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub client_id: Uuid,
    pub encrypted_query: String,
    pub lsh_hashes: Vec<u32>,
    pub top_k: usize,
    pub rerank_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultEntry {
    pub embedding_id: Uuid,
    pub encrypted_similarity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultEntry>,
    pub candidates_checked: usize,
    pub candidates_found: usize,
    pub search_time_ms: f64,
    pub lsh_time_ms: f64,
    pub he_compute_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub client_id: Uuid,
    pub name: String,
    pub total_embeddings: u64,
    pub total_searches: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error body every non-2xx response carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn from_error(err: &SearchError) -> Self {
        Self {
            error: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_b64_roundtrip() {
        let bytes = vec![0u8, 1, 254, 255, 42];
        let encoded = encode_b64(&bytes);
        assert_eq!(decode_b64(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_bad_ciphertext_b64_is_corrupt() {
        let err = decode_ciphertext_b64("not//valid==b64!").unwrap_err();
        assert!(matches!(err, SearchError::CorruptCiphertext(_)));
    }

    #[test]
    fn test_add_request_optional_fields_omitted() {
        let req = AddEmbeddingRequest {
            client_id: Uuid::nil(),
            encrypted_embedding: "AAAA".into(),
            lsh_hashes: vec![1, 2, 3],
            metadata: None,
            external_id: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("metadata"));
        assert!(!json.contains("external_id"));
    }

    #[test]
    fn test_search_request_deserialize() {
        let json = r#"{
            "client_id": "00000000-0000-0000-0000-000000000000",
            "encrypted_query": "AAAA",
            "lsh_hashes": [7, 11],
            "top_k": 5,
            "rerank_candidates": 50
        }"#;
        let req: SearchRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.lsh_hashes, vec![7, 11]);
        assert_eq!(req.top_k, 5);
        assert_eq!(req.rerank_candidates, 50);
    }

    #[test]
    fn test_context_params_roundtrip() {
        let ctx = HeContext {
            scheme: "mock".into(),
            poly_modulus_degree: 8192,
            scale: 1 << 40,
            public_key: vec![9, 8, 7],
        };
        let params = ContextParams::from_context(&ctx);
        assert_eq!(params.to_context().unwrap(), ctx);
    }

    #[test]
    fn test_error_body_carries_code() {
        let body = ErrorBody::from_error(&SearchError::QuotaExceeded(100));
        assert_eq!(body.error, "quota_exceeded");
        assert!(body.message.contains("100"));
    }
}
