//! Route handlers for the JSON API

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sealdex_core::protocol::{
    AddEmbeddingRequest, AddEmbeddingResponse, HealthResponse, InitializeRequest,
    InitializeResponse, SearchRequest, SearchResponse, SearchResultEntry, StatsResponse,
    decode_ciphertext_b64, encode_b64,
};
use sealdex_core::{LshPlanes, SearchError};
use sealdex_store::{ProvisionRequest, hash_api_key};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::auth::{AuthenticatedClient, bearer_token};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/initialize", post(initialize))
        .route("/add_embedding", post(add_embedding))
        .route("/search", post(search))
        .route("/stats/{client_id}", get(stats))
        .route("/clients/{client_id}/deactivate", post(deactivate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.db.ping().await {
        Ok(()) => Json(HealthResponse {
            status: "ok".into(),
            reason: None,
        })
        .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable".into(),
                reason: Some(err.to_string()),
            }),
        )
            .into_response(),
    }
}

/// Provision (or idempotently re-fetch) the client owned by the bearer
/// key, returning its id and the serialized LSH planes so client and
/// server hash identically.
async fn initialize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitializeRequest>,
) -> Result<Json<InitializeResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    if !state.limiter.check_and_record(&hash_api_key(token)) {
        return Err(SearchError::RateLimited.into());
    }

    let he = req.context_params.to_context()?;
    let provisioned = state
        .db
        .register_client(
            ProvisionRequest {
                name: req.name,
                api_key: token.to_string(),
                he,
                embedding_dim: req.embedding_dim,
                lsh: req.lsh_config,
            },
            state.config.server_secret.clone(),
            state.config.max_embeddings,
        )
        .await?;

    let record = &provisioned.record;
    if let Ok(planes) = LshPlanes::from_bytes(&record.lsh, record.embedding_dim, &provisioned.planes)
    {
        state.planes.put(record.id, Arc::new(planes));
    }
    if provisioned.created {
        info!("Provisioned client {} ({})", record.id, record.name);
    }

    Ok(Json(InitializeResponse {
        client_id: record.id,
        lsh_config: record.lsh,
        random_planes: encode_b64(&provisioned.planes),
    }))
}

async fn add_embedding(
    State(state): State<AppState>,
    auth: AuthenticatedClient,
    Json(req): Json<AddEmbeddingRequest>,
) -> Result<Json<AddEmbeddingResponse>, ApiError> {
    auth.require_owner(req.client_id)?;
    let ciphertext = decode_ciphertext_b64(&req.encrypted_embedding)?;
    let embedding_id = state
        .db
        .insert_embedding(
            req.client_id,
            ciphertext,
            req.lsh_hashes,
            req.metadata,
            req.external_id,
        )
        .await?;
    Ok(Json(AddEmbeddingResponse { embedding_id }))
}

async fn search(
    State(state): State<AppState>,
    auth: AuthenticatedClient,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    auth.require_owner(req.client_id)?;
    let query = decode_ciphertext_b64(&req.encrypted_query)?;
    let outcome = state
        .engine
        .search(&auth.0, query, req.lsh_hashes, req.top_k, req.rerank_candidates)
        .await?;

    Ok(Json(SearchResponse {
        results: outcome
            .results
            .into_iter()
            .map(|r| SearchResultEntry {
                embedding_id: r.embedding_id,
                encrypted_similarity: r.encrypted_similarity,
                metadata: r.metadata,
            })
            .collect(),
        candidates_checked: outcome.candidates_checked,
        candidates_found: outcome.candidates_found,
        search_time_ms: outcome.total_time_ms,
        lsh_time_ms: outcome.lsh_time_ms,
        he_compute_time_ms: outcome.he_compute_time_ms,
    }))
}

async fn stats(
    State(state): State<AppState>,
    auth: AuthenticatedClient,
    Path(client_id): Path<Uuid>,
) -> Result<Json<StatsResponse>, ApiError> {
    auth.require_owner(client_id)?;
    let record = state.db.get_client(client_id).await?;
    Ok(Json(StatsResponse {
        client_id: record.id,
        name: record.name,
        total_embeddings: record.total_embeddings,
        total_searches: record.total_searches,
        created_at: record.created_at,
        last_active_at: record.last_active_at,
        is_active: record.is_active,
    }))
}

/// Deactivate a client and drop its cached planes. Stored rows stay put;
/// every subsequent call under the key fails `Unauthenticated`.
async fn deactivate(
    State(state): State<AppState>,
    auth: AuthenticatedClient,
    Path(client_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require_owner(client_id)?;
    state.db.deactivate_client(client_id).await?;
    state.planes.invalidate(client_id);
    Ok(Json(serde_json::json!({ "status": "deactivated" })))
}
