//! Sync triggers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mailsync_core::AccountError;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{ApiError, required, sync_error_response};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct InitialSyncRequest {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitialSyncResponse {
    pub success: bool,
    pub stored: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    pub fetched: usize,
    pub stored: usize,
    pub failed: usize,
    pub delta_token: String,
}

/// POST /api/initial-sync
///
/// Runs the bootstrap sync inline and ingests the collected batch.
pub async fn initial_sync(
    State(state): State<AppState>,
    Json(req): Json<InitialSyncRequest>,
) -> Response {
    let (account_id, user_id) = match (
        required(&req.account_id, "account_id"),
        required(&req.user_id, "user_id"),
    ) {
        (Ok(a), Ok(u)) => (a, u),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let account = match state.sync.accounts().get_for_user(account_id, user_id).await {
        Ok(account) => account,
        Err(AccountError::NotFound(_)) => {
            return ApiError::not_found(format!("account not found: {account_id}"));
        }
        Err(err) => {
            error!(account_id, error = %err, "failed to load account");
            return ApiError::internal("Failed to load account");
        }
    };

    let session = state.sync.session(&account);
    let Some(batch) = session.perform_initial_sync().await else {
        return ApiError::internal("Initial sync failed");
    };

    let report = session.ingest_batch(&batch).await;
    info!(
        account_id = %account.id,
        stored = report.stored(),
        failed = report.failed(),
        "initial sync ingested"
    );

    (
        StatusCode::OK,
        Json(InitialSyncResponse {
            success: true,
            stored: report.stored(),
            failed: report.failed(),
        }),
    )
        .into_response()
}

/// POST /api/accounts/{id}/sync
pub async fn sync_account(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    let session = match state.sync.session_for(&account_id).await {
        Ok(session) => session,
        Err(err) => return sync_error_response(&err),
    };

    match session.sync_emails().await {
        Ok(sync) => (
            StatusCode::OK,
            Json(SyncResponse {
                fetched: sync.batch.emails.len(),
                stored: sync.report.stored(),
                failed: sync.report.failed(),
                delta_token: sync.batch.delta_token,
            }),
        )
            .into_response(),
        Err(err) => {
            error!(account_id = %account_id, error = %err, "incremental sync failed");
            sync_error_response(&err)
        }
    }
}
