//! SearchError → HTTP response mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sealdex_core::SearchError;
use sealdex_core::protocol::ErrorBody;
use tracing::warn;

/// Response wrapper so handlers can `?` on any `SearchError`
#[derive(Debug)]
pub struct ApiError(pub SearchError);

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &SearchError) -> StatusCode {
    match err {
        SearchError::Unauthenticated => StatusCode::UNAUTHORIZED,
        SearchError::NotFound(_) => StatusCode::NOT_FOUND,
        SearchError::ConfigConflict(_) | SearchError::DuplicateExternalId(_) => {
            StatusCode::CONFLICT
        }
        SearchError::QuotaExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
        SearchError::CorruptCiphertext(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SearchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SearchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SearchError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        SearchError::PlaintextLeak(_)
        | SearchError::Network(_)
        | SearchError::Transient(_)
        | SearchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}
