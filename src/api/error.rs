use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use crate::error::{ClientError, StoreError};
use crate::query::QueryError;

/// Error returned by every handler; rendered as `{ "message": .. }`.
#[derive(Debug)]
pub enum ApiError {
    /// Unknown instrument, unsupported interval or bad parameter.
    Unprocessable(String),
    NotFound(String),
    /// Upstream failed and nothing stored could stand in.
    Upstream(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unprocessable(msg) => write!(f, "unprocessable: {msg}"),
            Self::NotFound(msg) => write!(f, "not_found: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream_error: {msg}"),
            Self::Internal(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Upstream(msg) => {
                warn!(error = %msg, "request failed upstream");
                (StatusCode::BAD_GATEWAY, msg)
            }
            Self::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, axum::Json(json!({ "message": message }))).into_response()
    }
}

impl From<ClientError> for ApiError {
    fn from(e: ClientError) -> Self {
        Self::Upstream(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Upstream(e) => e.into(),
            QueryError::Store(e) => e.into(),
        }
    }
}
