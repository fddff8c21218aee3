//! sealdex-engine — the server-side retrieval pipeline
//!
//! One entry point: [`SearchEngine::search`]. Filters candidates through
//! the LSH posting index, bulk-fetches their ciphertexts, computes an
//! encrypted inner product per candidate, and packages the still-encrypted
//! scores for the key-holding client. Ordering ciphertexts server-side
//! would need an oblivious comparator the HE schemes don't cheaply give
//! us, so every scored candidate goes back and the client selects top-k
//! after decryption.

use std::time::{Duration, Instant};

use sealdex_core::protocol::encode_b64;
use sealdex_core::{ClientRecord, SearchError, codec_for};
use sealdex_store::SearchDb;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Engine-level knobs, shared by every request
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-bucket candidate ceiling before deterministic subsampling
    pub max_bucket_fanout: usize,
    /// Wall-clock budget per search request
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bucket_fanout: 2048,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// One scored candidate: the similarity is a ciphertext only the client
/// can decrypt.
#[derive(Debug, Clone)]
pub struct ScoredResult {
    pub embedding_id: Uuid,
    pub encrypted_similarity: String,
    pub metadata: Option<Value>,
}

/// Everything a search returns, including stage timings
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Encrypted scores in LSH rank order (match-count descending)
    pub results: Vec<ScoredResult>,
    pub candidates_found: usize,
    pub candidates_checked: usize,
    pub truncated_buckets: usize,
    pub lsh_time_ms: f64,
    pub he_compute_time_ms: f64,
    pub total_time_ms: f64,
}

pub struct SearchEngine {
    db: SearchDb,
    config: EngineConfig,
}

impl SearchEngine {
    pub fn new(db: SearchDb, config: EngineConfig) -> Self {
        Self { db, config }
    }

    pub fn db(&self) -> &SearchDb {
        &self.db
    }

    /// Run a search within the engine's wall-clock budget.
    ///
    /// `top_k` is validated (`1 ≤ top_k ≤ rerank`) but the result list is
    /// not truncated to it: the client applies top-k after decrypting.
    /// `rerank` is clamped to the client's configured candidate ceiling.
    pub async fn search(
        &self,
        client: &ClientRecord,
        encrypted_query: Vec<u8>,
        query_hashes: Vec<u32>,
        top_k: usize,
        rerank: usize,
    ) -> Result<SearchOutcome, SearchError> {
        let budget = self.config.request_timeout;
        match tokio::time::timeout(
            budget,
            self.search_inner(client, encrypted_query, query_hashes, top_k, rerank),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SearchError::Timeout(budget.as_millis() as u64)),
        }
    }

    async fn search_inner(
        &self,
        client: &ClientRecord,
        encrypted_query: Vec<u8>,
        query_hashes: Vec<u32>,
        top_k: usize,
        rerank: usize,
    ) -> Result<SearchOutcome, SearchError> {
        if top_k == 0 {
            return Err(SearchError::InvalidRequest("top_k must be at least 1".into()));
        }
        if top_k > rerank {
            return Err(SearchError::InvalidRequest(format!(
                "top_k ({top_k}) must not exceed rerank_candidates ({rerank})"
            )));
        }
        if query_hashes.len() != client.lsh.num_tables as usize {
            return Err(SearchError::InvalidRequest(format!(
                "expected {} lsh hashes, got {}",
                client.lsh.num_tables,
                query_hashes.len()
            )));
        }
        let rerank = rerank.min(client.lsh.num_candidates as usize);

        let total_start = Instant::now();

        let lsh_start = Instant::now();
        let candidates = self
            .db
            .lsh_candidates(client.id, query_hashes, rerank, self.config.max_bucket_fanout)
            .await?;
        let lsh_time_ms = elapsed_ms(lsh_start);

        if candidates.ids.is_empty() {
            self.db.record_search(client.id).await?;
            return Ok(SearchOutcome {
                results: Vec::new(),
                candidates_found: candidates.found,
                candidates_checked: 0,
                truncated_buckets: candidates.truncated_buckets,
                lsh_time_ms,
                he_compute_time_ms: 0.0,
                total_time_ms: elapsed_ms(total_start),
            });
        }

        let fetched = self
            .db
            .fetch_embeddings(client.id, candidates.ids.clone())
            .await?;
        let candidates_checked = fetched.len();

        let codec = codec_for(&client.he, client.embedding_dim)?;

        // CPU-bound homomorphic scoring; keep it off the async workers
        let he_start = Instant::now();
        let results = tokio::task::spawn_blocking(move || {
            let query = codec.deserialize(&encrypted_query)?;
            let mut out = Vec::with_capacity(fetched.len());
            for item in fetched {
                let cipher = codec.deserialize(&item.ciphertext)?;
                let score = codec.inner_product(&query, &cipher)?;
                out.push(ScoredResult {
                    embedding_id: item.id,
                    encrypted_similarity: encode_b64(&codec.encode_scalar_bytes(&score)),
                    metadata: item.metadata,
                });
            }
            Ok::<_, SearchError>(out)
        })
        .await
        .map_err(|e| SearchError::Internal(format!("scoring task panicked: {e}")))??;
        let he_compute_time_ms = elapsed_ms(he_start);

        self.db.record_search(client.id).await?;

        debug!(
            "Search for client {}: {} found, {} checked, {} returned ({:.1} ms lsh, {:.1} ms he)",
            client.id,
            candidates.found,
            candidates_checked,
            results.len(),
            lsh_time_ms,
            he_compute_time_ms,
        );

        Ok(SearchOutcome {
            results,
            candidates_found: candidates.found,
            candidates_checked,
            truncated_buckets: candidates.truncated_buckets,
            lsh_time_ms,
            he_compute_time_ms,
            total_time_ms: elapsed_ms(total_start),
        })
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealdex_core::types::{HeContext, LshConfig};
    use sealdex_core::{HeCodec, MockHeCodec};
    use sealdex_store::ProvisionRequest;

    const DIM: usize = 8;

    async fn engine_with_client() -> (SearchEngine, ClientRecord) {
        let db = SearchDb::open_in_memory().unwrap();
        let p = db
            .register_client(
                ProvisionRequest {
                    name: None,
                    api_key: "key".into(),
                    he: HeContext {
                        scheme: "mock".into(),
                        poly_modulus_degree: 4096,
                        scale: 1 << 30,
                        public_key: vec![],
                    },
                    embedding_dim: DIM,
                    lsh: LshConfig {
                        num_tables: 2,
                        hash_size: 8,
                        num_candidates: 10,
                    },
                },
                "secret".into(),
                1000,
            )
            .await
            .unwrap();
        (SearchEngine::new(db, EngineConfig::default()), p.record)
    }

    fn encrypt(v: &[f32]) -> Vec<u8> {
        let codec = MockHeCodec::new(DIM);
        codec.serialize(&codec.encode_vector(v).unwrap())
    }

    fn unit(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[i % DIM] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_empty_candidates_is_ok_with_timings() {
        let (engine, client) = engine_with_client().await;
        let outcome = engine
            .search(&client, encrypt(&unit(0)), vec![1, 2], 3, 5)
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.candidates_found, 0);
        assert_eq!(outcome.candidates_checked, 0);
        assert!(outcome.total_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_scores_decrypt_to_inner_products() {
        let (engine, client) = engine_with_client().await;
        let db = engine.db().clone();

        let stored = unit(0);
        let id = db
            .insert_embedding(client.id, encrypt(&stored), vec![7, 9], None, None)
            .await
            .unwrap();

        let outcome = engine
            .search(&client, encrypt(&stored), vec![7, 9], 1, 5)
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].embedding_id, id);

        let codec = MockHeCodec::new(DIM);
        let bytes = sealdex_core::protocol::decode_b64(&outcome.results[0].encrypted_similarity)
            .unwrap();
        let scalar = codec.decode_scalar_bytes(&bytes).unwrap();
        let score = codec.decrypt_scalar(&scalar).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rerank_clamped_to_client_ceiling() {
        let (engine, client) = engine_with_client().await;
        let db = engine.db().clone();
        for _ in 0..20 {
            db.insert_embedding(client.id, encrypt(&unit(1)), vec![3, 4], None, None)
                .await
                .unwrap();
        }

        // rerank asks for 500, client config caps candidates at 10
        let outcome = engine
            .search(&client, encrypt(&unit(1)), vec![3, 4], 5, 500)
            .await
            .unwrap();
        assert!(outcome.candidates_checked <= 10);
        assert_eq!(outcome.results.len(), outcome.candidates_checked);
        assert_eq!(outcome.candidates_found, 20);
    }

    #[tokio::test]
    async fn test_invalid_ranges_rejected() {
        let (engine, client) = engine_with_client().await;
        let query = encrypt(&unit(0));
        assert!(matches!(
            engine.search(&client, query.clone(), vec![1, 2], 0, 5).await,
            Err(SearchError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.search(&client, query.clone(), vec![1, 2], 6, 5).await,
            Err(SearchError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.search(&client, query, vec![1], 1, 5).await,
            Err(SearchError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_query_aborts() {
        let (engine, client) = engine_with_client().await;
        let db = engine.db().clone();
        db.insert_embedding(client.id, encrypt(&unit(0)), vec![1, 2], None, None)
            .await
            .unwrap();

        let err = engine
            .search(&client, vec![0u8; 64], vec![1, 2], 1, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::CorruptCiphertext(_)));
    }

    #[tokio::test]
    async fn test_corrupt_stored_ciphertext_aborts() {
        let (engine, client) = engine_with_client().await;
        let db = engine.db().clone();
        db.insert_embedding(client.id, vec![0xde, 0xad], vec![1, 2], None, None)
            .await
            .unwrap();

        let err = engine
            .search(&client, encrypt(&unit(0)), vec![1, 2], 1, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::CorruptCiphertext(_)));
    }

    #[tokio::test]
    async fn test_search_bumps_counter() {
        let (engine, client) = engine_with_client().await;
        engine
            .search(&client, encrypt(&unit(0)), vec![1, 2], 1, 5)
            .await
            .unwrap();
        let record = engine.db().get_client(client.id).await.unwrap();
        assert_eq!(record.total_searches, 1);
    }
}
