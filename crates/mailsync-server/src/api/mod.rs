//! HTTP API handlers.
//!
//! - POST /api/accounts - Link a provider credential
//! - POST /api/accounts/{id}/sync - Incremental sync now
//! - POST /api/accounts/{id}/messages - Send a message
//! - POST /api/initial-sync - Bootstrap sync and ingest

pub mod accounts;
pub mod sync;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use mailsync_core::{ProviderError, SyncError};
use serde::{Deserialize, Serialize};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/accounts", accounts::router())
        .route("/initial-sync", post(sync::initial_sync))
}

/// Error response for API errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    fn respond(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
        (status, Json(Self::new(error, message))).into_response()
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Response {
        Self::respond(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Response {
        Self::respond(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Response {
        Self::respond(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub(crate) fn provider(err: &ProviderError) -> Response {
        Self::respond(StatusCode::BAD_GATEWAY, "provider_error", err.to_string())
    }
}

pub(crate) fn sync_error_response(err: &SyncError) -> Response {
    match err {
        SyncError::NotReady(_) => ApiError::respond(StatusCode::CONFLICT, "not_ready", err.to_string()),
        SyncError::AccountNotFound(_) => ApiError::not_found(err.to_string()),
        SyncError::Provider(inner) => ApiError::provider(inner),
        SyncError::MissingSnapshotToken => {
            ApiError::respond(StatusCode::BAD_GATEWAY, "provider_error", err.to_string())
        }
        SyncError::TokenStore(_) => ApiError::internal(err.to_string()),
    }
}

/// Treats absent and blank strings the same.
pub(crate) fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, Response> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::bad_request(format!("missing field: {field}"))),
    }
}
