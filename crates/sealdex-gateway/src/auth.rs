//! Bearer-token authentication

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use sealdex_core::{ClientRecord, SearchError};

use crate::error::ApiError;
use crate::state::AppState;

/// Pull the bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, SearchError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(SearchError::Unauthenticated)?
        .to_str()
        .map_err(|_| SearchError::Unauthenticated)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(SearchError::Unauthenticated)?
        .trim();
    if token.is_empty() {
        return Err(SearchError::Unauthenticated);
    }
    Ok(token)
}

/// Extractor: resolves the bearer key to an active client record and
/// applies the per-client rate limit. Routes that take this cannot be
/// reached anonymously.
pub struct AuthenticatedClient(pub ClientRecord);

impl AuthenticatedClient {
    /// The authenticated key must own the client id named in the request.
    pub fn require_owner(&self, client_id: uuid::Uuid) -> Result<(), SearchError> {
        if self.0.id != client_id {
            return Err(SearchError::Unauthenticated);
        }
        Ok(())
    }
}

impl FromRequestParts<AppState> for AuthenticatedClient {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let record = state.db.authenticate(token).await?;
        if !state.limiter.check_and_record(&record.id.to_string()) {
            return Err(SearchError::RateLimited.into());
        }
        Ok(Self(record))
    }
}
