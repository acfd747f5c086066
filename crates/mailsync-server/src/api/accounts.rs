//! Account linking and outbound mail.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::{DateTime, Utc};
use mailsync_core::provider::OutgoingEmail;
use mailsync_core::{Account, AccountError, NewAccount, SyncService};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{ApiError, required};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(link_account))
        .route("/{id}/sync", post(super::sync::sync_account))
        .route("/{id}/messages", post(send_message))
}

#[derive(Debug, Default, Deserialize)]
pub struct LinkAccountRequest {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Account view without the credential.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountSummary {
    pub id: String,
    pub user_id: String,
    pub email_address: String,
    pub name: Option<String>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountSummary {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            user_id: account.user_id,
            email_address: account.email_address,
            name: account.name,
            synced: account.next_delta_token.is_some(),
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// POST /api/accounts
///
/// Looks the credential up at the provider, stores the account and starts
/// the bootstrap sync in the background.
pub async fn link_account(
    State(state): State<AppState>,
    Json(req): Json<LinkAccountRequest>,
) -> Response {
    let (account_id, user_id, access_token) = match (
        required(&req.account_id, "account_id"),
        required(&req.user_id, "user_id"),
        required(&req.access_token, "access_token"),
    ) {
        (Ok(a), Ok(u), Ok(t)) => (a.to_string(), u.to_string(), t.to_string()),
        (Err(resp), _, _) | (_, Err(resp), _) | (_, _, Err(resp)) => return resp,
    };

    let details = match state.sync.client(&access_token).account_details().await {
        Ok(details) => details,
        Err(err) => {
            warn!(account_id = %account_id, error = %err, "failed to fetch account details");
            return ApiError::provider(&err);
        }
    };

    let linked = state
        .sync
        .accounts()
        .upsert_linked(NewAccount {
            id: account_id,
            user_id,
            email_address: details.email,
            name: details.name,
            access_token,
        })
        .await;
    let account = match linked {
        Ok(account) => account,
        Err(err) => {
            error!(error = %err, "failed to store linked account");
            return ApiError::internal("Failed to store account");
        }
    };

    info!(account_id = %account.id, "account linked");
    tokio::spawn(bootstrap(state.sync.clone(), account.clone()));

    (StatusCode::OK, Json(AccountSummary::from(account))).into_response()
}

async fn bootstrap(service: SyncService, account: Account) {
    let session = service.session(&account);
    let Some(batch) = session.perform_initial_sync().await else {
        return;
    };
    let report = session.ingest_batch(&batch).await;
    info!(
        account_id = %account.id,
        stored = report.stored(),
        failed = report.failed(),
        "bootstrap ingest finished"
    );
}

/// POST /api/accounts/{id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(email): Json<OutgoingEmail>,
) -> Response {
    let account = match state.sync.accounts().get_by_id(&account_id).await {
        Ok(account) => account,
        Err(AccountError::NotFound(_)) => {
            return ApiError::not_found(format!("account not found: {account_id}"));
        }
        Err(err) => {
            error!(account_id = %account_id, error = %err, "failed to load account");
            return ApiError::internal("Failed to load account");
        }
    };

    match state.sync.client(&account.access_token).send_email(&email).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => ApiError::provider(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{link, setup_db, state};
    use axum::body::to_bytes;
    use serde_json::{Value, json};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn link_request(token: &str) -> LinkAccountRequest {
        LinkAccountRequest {
            account_id: Some("acc-1".into()),
            user_id: Some("user-1".into()),
            access_token: Some(token.into()),
        }
    }

    #[tokio::test]
    async fn link_account_stores_provider_details() {
        let (db, _dir) = setup_db().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"email": "me@x.com", "name": "Me"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = link_account(State(state(db.clone(), &server)), Json(link_request("fresh"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let summary: AccountSummary = body_json(response).await;
        assert_eq!(summary.id, "acc-1");
        assert_eq!(summary.email_address, "me@x.com");
        assert_eq!(summary.name.as_deref(), Some("Me"));
        assert!(!summary.synced);

        let stored = mailsync_core::AccountRepository::new(db)
            .get_by_id("acc-1")
            .await
            .expect("stored");
        assert_eq!(stored.access_token, "fresh");
    }

    #[tokio::test]
    async fn link_account_rejects_missing_fields() {
        let (db, _dir) = setup_db().await;
        let server = MockServer::start().await;
        let req = LinkAccountRequest {
            access_token: Some("   ".into()),
            ..link_request("unused")
        };

        let response = link_account(State(state(db, &server)), Json(req)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiError = body_json(response).await;
        assert_eq!(body.message, "missing field: access_token");
    }

    #[tokio::test]
    async fn link_account_maps_provider_failure_to_bad_gateway() {
        let (db, _dir) = setup_db().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let response = link_account(State(state(db.clone(), &server)), Json(link_request("bad"))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let accounts = mailsync_core::AccountRepository::new(db)
            .list_all()
            .await
            .expect("list");
        assert!(accounts.is_empty());
    }

    #[tokio::test]
    async fn send_message_uses_account_credential() {
        let (db, _dir) = setup_db().await;
        link(&db, "acc-1").await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/email/messages"))
            .and(query_param("returnIds", "true"))
            .and(header("authorization", "Bearer token-acc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "sent-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let email: OutgoingEmail = serde_json::from_value(json!({
            "from": {"address": "acc-1@example.com"},
            "subject": "hi",
            "body": "<p>hi</p>",
            "to": [{"address": "you@x.com"}]
        }))
        .expect("email");
        let response = send_message(
            State(state(db, &server)),
            Path("acc-1".to_string()),
            Json(email),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response).await;
        assert_eq!(body["id"], "sent-1");
    }

    #[tokio::test]
    async fn send_message_for_unknown_account_is_not_found() {
        let (db, _dir) = setup_db().await;
        let server = MockServer::start().await;
        let email: OutgoingEmail = serde_json::from_value(json!({
            "from": {"address": "x@example.com"},
            "subject": "hi",
            "body": "",
            "to": []
        }))
        .expect("email");

        let response = send_message(
            State(state(db, &server)),
            Path("ghost".to_string()),
            Json(email),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
