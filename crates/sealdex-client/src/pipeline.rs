//! The client-side search pipeline

use std::sync::Arc;

use reqwest::Client;
use sealdex_core::protocol::{
    AddEmbeddingRequest, AddEmbeddingResponse, ContextParams, ErrorBody, InitializeRequest,
    InitializeResponse, SearchRequest, SearchResponse, StatsResponse, decode_b64, encode_b64,
};
use sealdex_core::types::HeContext;
use sealdex_core::{Embedder, HeCodec, LshPlanes, SearchError, SeededEmbedder, codec_for};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClientConfig;

/// A decrypted, ranked search hit
#[derive(Debug, Clone)]
pub struct RankedResult {
    pub embedding_id: Uuid,
    pub similarity: f32,
    pub metadata: Option<Value>,
}

/// Persistable session: enough to resume without re-calling `initialize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub client_id: Uuid,
    pub planes: String,
}

struct Session {
    client_id: Uuid,
    planes: LshPlanes,
    codec: Arc<dyn HeCodec>,
}

/// Client pipeline: embed → hash → encrypt → upload / search → decrypt.
pub struct SearchPipeline {
    http: Client,
    config: ClientConfig,
    embedder: Box<dyn Embedder>,
    session: Option<Session>,
}

impl SearchPipeline {
    pub fn new(config: ClientConfig) -> Self {
        let embedder = Box::new(SeededEmbedder::new(config.embedding_dim));
        Self::with_embedder(config, embedder)
    }

    pub fn with_embedder(config: ClientConfig, embedder: Box<dyn Embedder>) -> Self {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            config,
            embedder,
            session: None,
        }
    }

    fn he_context(&self) -> HeContext {
        // The mock scheme has no real keypair; a key-derived tag keeps
        // re-initialization byte-identical.
        let public_key: [u8; 32] =
            Sha256::digest(format!("{}/public-key", self.config.api_key).as_bytes()).into();
        HeContext {
            scheme: self.config.scheme.clone(),
            poly_modulus_degree: self.config.poly_modulus_degree,
            scale: self.config.scale,
            public_key: public_key.to_vec(),
        }
    }

    /// Provision (or resume) this key's client on the server and build the
    /// local hashing/encryption state from the returned planes.
    pub async fn initialize(&mut self) -> Result<Uuid, SearchError> {
        let he = self.he_context();
        let request = InitializeRequest {
            context_params: ContextParams::from_context(&he),
            embedding_dim: self.config.embedding_dim,
            lsh_config: self.config.lsh,
            name: None,
        };
        let response: InitializeResponse = self.post_json("initialize", &request).await?;

        let planes_bytes = decode_b64(&response.random_planes)?;
        let planes = LshPlanes::from_bytes(
            &response.lsh_config,
            self.config.embedding_dim,
            &planes_bytes,
        )?;
        let codec = codec_for(&he, self.config.embedding_dim)?;

        info!("Initialized as client {}", response.client_id);
        self.session = Some(Session {
            client_id: response.client_id,
            planes,
            codec,
        });
        Ok(response.client_id)
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.client_id)
    }

    /// Export the session for persistence across process restarts.
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|s| SessionState {
            client_id: s.client_id,
            planes: encode_b64(&s.planes.to_bytes()),
        })
    }

    /// Rebuild the session from persisted state, skipping `initialize`.
    pub fn restore_session(&mut self, state: SessionState) -> Result<(), SearchError> {
        let planes_bytes = decode_b64(&state.planes)?;
        let planes =
            LshPlanes::from_bytes(&self.config.lsh, self.config.embedding_dim, &planes_bytes)?;
        let codec = codec_for(&self.he_context(), self.config.embedding_dim)?;
        self.session = Some(Session {
            client_id: state.client_id,
            planes,
            codec,
        });
        Ok(())
    }

    fn session(&self) -> Result<&Session, SearchError> {
        self.session
            .as_ref()
            .ok_or_else(|| SearchError::InvalidRequest("pipeline is not initialized".into()))
    }

    /// Embed, encrypt, and upload a text with optional metadata.
    pub async fn add_embedding(
        &self,
        text: &str,
        metadata: Option<Value>,
        external_id: Option<String>,
    ) -> Result<Uuid, SearchError> {
        let vector = self.embedder.embed(text)?;
        self.add_vector(&vector, metadata, external_id).await
    }

    /// Upload a caller-supplied vector.
    pub async fn add_vector(
        &self,
        vector: &[f32],
        metadata: Option<Value>,
        external_id: Option<String>,
    ) -> Result<Uuid, SearchError> {
        let session = self.session()?;
        let metadata = prepare_metadata(metadata, self.config.strip_plaintext_metadata)?;

        let hashes = session.planes.hash_vector(vector)?;
        let cipher = session.codec.encode_vector(vector)?;
        let request = AddEmbeddingRequest {
            client_id: session.client_id,
            encrypted_embedding: encode_b64(&session.codec.serialize(&cipher)),
            lsh_hashes: hashes,
            metadata,
            external_id,
        };

        let response: AddEmbeddingResponse = self.post_json("add_embedding", &request).await?;
        debug!("Uploaded embedding {}", response.embedding_id);
        Ok(response.embedding_id)
    }

    /// Search by text; scores are decrypted and ranked locally.
    pub async fn search_text(
        &self,
        text: &str,
        top_k: usize,
        rerank: usize,
    ) -> Result<(Vec<RankedResult>, SearchResponse), SearchError> {
        let vector = self.embedder.embed(text)?;
        self.search_vector(&vector, top_k, rerank).await
    }

    /// Search by vector; scores are decrypted and ranked locally.
    pub async fn search_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        rerank: usize,
    ) -> Result<(Vec<RankedResult>, SearchResponse), SearchError> {
        let session = self.session()?;
        let hashes = session.planes.hash_vector(vector)?;
        let cipher = session.codec.encode_query(vector)?;
        let request = SearchRequest {
            client_id: session.client_id,
            encrypted_query: encode_b64(&session.codec.serialize(&cipher)),
            lsh_hashes: hashes,
            top_k,
            rerank_candidates: rerank,
        };

        let response: SearchResponse = self.post_json("search", &request).await?;

        let mut ranked = Vec::with_capacity(response.results.len());
        for entry in &response.results {
            let bytes = decode_b64(&entry.encrypted_similarity)?;
            let scalar = session.codec.decode_scalar_bytes(&bytes)?;
            ranked.push(RankedResult {
                embedding_id: entry.embedding_id,
                similarity: session.codec.decrypt_scalar(&scalar)?,
                metadata: entry.metadata.clone(),
            });
        }
        ranked.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(top_k);

        debug!(
            "Search returned {} of {} scored candidates",
            ranked.len(),
            response.results.len()
        );
        Ok((ranked, response))
    }

    pub async fn stats(&self) -> Result<StatsResponse, SearchError> {
        let session = self.session()?;
        let url = format!(
            "{}/stats/{}",
            self.config.server_url.trim_end_matches('/'),
            session.client_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| SearchError::Network(e.to_string()))?;
        Self::handle(response).await
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, SearchError> {
        let url = format!("{}/{path}", self.config.server_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| SearchError::Network(e.to_string()))?;
        Self::handle(response).await
    }

    async fn handle<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, SearchError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| SearchError::Internal(format!("unparsable response: {e}")));
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => Err(SearchError::from_wire(&err.error, &err.message)),
            Err(_) if status.as_u16() == 401 => Err(SearchError::Unauthenticated),
            Err(_) => Err(SearchError::Internal(format!("HTTP {status}: {body}"))),
        }
    }
}

/// Apply the strip flag, then verify nothing plaintext-shaped survives.
///
/// Stripping only removes the top-level `text` key; if a `text` field is
/// still reachable anywhere in the metadata afterwards the upload is
/// aborted rather than silently scrubbed.
fn prepare_metadata(metadata: Option<Value>, strip: bool) -> Result<Option<Value>, SearchError> {
    let Some(mut metadata) = metadata else {
        return Ok(None);
    };
    if strip {
        if let Some(object) = metadata.as_object_mut() {
            object.remove("text");
        }
        if contains_text_field(&metadata) {
            return Err(SearchError::PlaintextLeak(
                "metadata still contains a 'text' field after stripping".into(),
            ));
        }
    }
    Ok(Some(metadata))
}

fn contains_text_field(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key("text") || map.values().any(contains_text_field)
        }
        Value::Array(items) => items.iter().any(contains_text_field),
        _ => false,
    }
}
