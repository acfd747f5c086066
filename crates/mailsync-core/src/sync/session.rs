use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::delta_token::{DeltaTokenError, DeltaTokenStore};
use crate::ingest::{IngestPipeline, IngestReport};
use crate::provider::{ProviderClient, ProviderError, RawMessage, RejectedRecord, SyncCursor};

pub const DEFAULT_READINESS_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("account {0} has no delta token; run an initial sync first")]
    NotReady(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("snapshot reported ready without a sync token")]
    MissingSnapshotToken,
    #[error("delta token storage error: {0}")]
    TokenStore(String),
}

impl From<DeltaTokenError> for SyncError {
    fn from(err: DeltaTokenError) -> Self {
        match err {
            DeltaTokenError::AccountNotFound(id) => SyncError::AccountNotFound(id),
            DeltaTokenError::Storage(message) => SyncError::TokenStore(message),
        }
    }
}

/// All records of one fully traversed page chain and the cursor that resumes after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBatch {
    pub emails: Vec<RawMessage>,
    /// Records the provider sent that could not be decoded.
    pub rejected: Vec<RejectedRecord>,
    pub delta_token: String,
}

#[derive(Debug)]
pub struct IncrementalSync {
    pub batch: SyncBatch,
    pub report: IngestReport,
}

/// Sync driver for a single account.
pub struct SyncSession {
    account_id: String,
    client: ProviderClient,
    tokens: Arc<dyn DeltaTokenStore>,
    pipeline: IngestPipeline,
    poll_interval: Duration,
}

impl SyncSession {
    pub fn new(
        account_id: impl Into<String>,
        client: ProviderClient,
        tokens: Arc<dyn DeltaTokenStore>,
        pipeline: IngestPipeline,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            client,
            tokens,
            pipeline,
            poll_interval: DEFAULT_READINESS_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    /// Start a snapshot and poll until the provider reports it ready.
    /// There is no attempt limit.
    pub async fn wait_for_snapshot(&self) -> Result<String, SyncError> {
        let mut attempt: u64 = 1;
        loop {
            let status = self.client.start_snapshot().await?;
            if status.ready {
                return status
                    .sync_updated_token
                    .filter(|token| !token.is_empty())
                    .ok_or(SyncError::MissingSnapshotToken);
            }
            debug!(account_id = %self.account_id, attempt, "snapshot not ready");
            attempt += 1;
            sleep(self.poll_interval).await;
        }
    }

    /// Follow `nextPageToken` from `seed` until the chain ends. The last
    /// `nextDeltaToken` seen wins; `seed` is kept if no page carried one.
    pub async fn traverse(&self, seed: &str) -> Result<SyncBatch, SyncError> {
        let mut page = self
            .client
            .fetch_page(&SyncCursor::Delta(seed.to_string()))
            .await?;
        let mut delta_token = seed.to_string();
        let mut emails = Vec::new();
        let mut rejected = Vec::new();
        let mut pages = 1usize;

        loop {
            let (mut messages, mut bad) = page.take_messages();
            for record in &bad {
                warn!(
                    account_id = %self.account_id,
                    message_id = record.id.as_deref().unwrap_or_default(),
                    error = %record.error,
                    "skipping undecodable record"
                );
            }
            emails.append(&mut messages);
            rejected.append(&mut bad);
            if let Some(token) = page.next_delta_token.take() {
                delta_token = token;
            }
            let Some(next) = page.next_page_token.take() else {
                break;
            };
            page = self.client.fetch_page(&SyncCursor::Page(next)).await?;
            pages += 1;
        }

        debug!(
            account_id = %self.account_id,
            pages,
            records = emails.len(),
            rejected = rejected.len(),
            "page chain complete"
        );
        Ok(SyncBatch {
            emails,
            rejected,
            delta_token,
        })
    }

    /// Store a traversed batch. Undecodable records show up as failures in
    /// the report next to the messages that did not store.
    pub async fn ingest_batch(&self, batch: &SyncBatch) -> IngestReport {
        let mut report = self.pipeline.ingest(&self.account_id, &batch.emails).await;
        report.record_rejected(&batch.rejected);
        report
    }

    /// Bootstrap sync that propagates failures. The cursor is saved once,
    /// after the page chain ends. Messages are returned, not ingested.
    pub async fn try_initial_sync(&self) -> Result<SyncBatch, SyncError> {
        let snapshot_token = self.wait_for_snapshot().await?;
        let batch = self.traverse(&snapshot_token).await?;
        self.tokens
            .save(&self.account_id, &batch.delta_token)
            .await?;

        info!(
            account_id = %self.account_id,
            records = batch.emails.len(),
            "initial sync completed"
        );
        Ok(batch)
    }

    /// Bootstrap sync that logs failures and yields `None` instead.
    pub async fn perform_initial_sync(&self) -> Option<SyncBatch> {
        match self.try_initial_sync().await {
            Ok(batch) => Some(batch),
            Err(err) => {
                error!(account_id = %self.account_id, error = %err, "error during initial sync");
                None
            }
        }
    }

    /// Incremental sync from the stored cursor. Fails before any provider
    /// call when the account is missing or has never been bootstrapped.
    pub async fn sync_emails(&self) -> Result<IncrementalSync, SyncError> {
        let seed = self
            .tokens
            .load(&self.account_id)
            .await?
            .ok_or_else(|| SyncError::NotReady(self.account_id.clone()))?;

        let batch = self.traverse(&seed).await?;
        let report = self.ingest_batch(&batch).await;
        self.tokens
            .save(&self.account_id, &batch.delta_token)
            .await?;

        info!(
            account_id = %self.account_id,
            records = batch.emails.len(),
            stored = report.stored(),
            failed = report.failed(),
            "incremental sync completed"
        );
        Ok(IncrementalSync { batch, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::tests::{seed_account, setup_db};
    use crate::delta_token::memory::MemoryTokenStore;
    use reqwest::Client;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn record(id: &str) -> Value {
        json!({
            "id": id,
            "threadId": format!("thread-{id}"),
            "from": {"address": "a@x.com"},
            "to": [{"address": "b@x.com"}],
            "sysLabels": ["inbox"],
            "sentAt": "2024-01-01T00:00:00Z"
        })
    }

    async fn session(
        server: &MockServer,
        tokens: Arc<MemoryTokenStore>,
    ) -> (SyncSession, tempfile::TempDir) {
        let (db, dir) = setup_db().await;
        seed_account(&db, "acc-1").await;
        let client = ProviderClient::new(Client::new(), "token").with_api_base(server.uri());
        let session = SyncSession::new("acc-1", client, tokens, IngestPipeline::new(db))
            .with_poll_interval(Duration::from_millis(5));
        (session, dir)
    }

    struct SnapshotResponder {
        calls: Arc<AtomicUsize>,
        ready_after: usize,
    }

    impl Respond for SnapshotResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.ready_after {
                ResponseTemplate::new(200).set_body_json(json!({"ready": false}))
            } else {
                ResponseTemplate::new(200).set_body_json(json!({
                    "ready": true,
                    "syncUpdatedToken": "snap-token",
                    "syncDeletedToken": "deleted"
                }))
            }
        }
    }

    async fn mount_page(server: &MockServer, key: &str, value: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path("/email/sync/updated"))
            .and(query_param(key, value))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn initial_sync_polls_until_ready_and_collects_every_page() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("POST"))
            .and(path("/email/sync"))
            .respond_with(SnapshotResponder {
                calls: calls.clone(),
                ready_after: 3,
            })
            .expect(3)
            .mount(&server)
            .await;
        mount_page(
            &server,
            "deltaToken",
            "snap-token",
            json!({"records": [record("e1")], "nextPageToken": "p2"}),
        )
        .await;
        mount_page(
            &server,
            "pageToken",
            "p2",
            json!({"records": [record("e2"), record("e3")], "nextPageToken": "p3"}),
        )
        .await;
        mount_page(
            &server,
            "pageToken",
            "p3",
            json!({"records": [record("e4")], "nextDeltaToken": "delta-final"}),
        )
        .await;

        let tokens = Arc::new(MemoryTokenStore::with_account("acc-1", None).await);
        let (session, _dir) = session(&server, tokens.clone()).await;

        let batch = session.perform_initial_sync().await.expect("batch");
        let ids: Vec<_> = batch.emails.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3", "e4"]);
        assert_eq!(batch.delta_token, "delta-final");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let saves = tokens.saves.lock().await.clone();
        assert_eq!(saves, vec![("acc-1".to_string(), "delta-final".to_string())]);
    }

    #[tokio::test]
    async fn initial_sync_falls_back_to_snapshot_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/email/sync"))
            .respond_with(SnapshotResponder {
                calls: Arc::new(AtomicUsize::new(0)),
                ready_after: 1,
            })
            .mount(&server)
            .await;
        mount_page(&server, "deltaToken", "snap-token", json!({"records": []})).await;

        let tokens = Arc::new(MemoryTokenStore::with_account("acc-1", None).await);
        let (session, _dir) = session(&server, tokens.clone()).await;

        let batch = session.try_initial_sync().await.expect("batch");
        assert!(batch.emails.is_empty());
        assert_eq!(batch.delta_token, "snap-token");
        assert_eq!(
            tokens.load("acc-1").await.expect("load").as_deref(),
            Some("snap-token")
        );
    }

    #[tokio::test]
    async fn failed_page_leaves_cursor_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/email/sync"))
            .respond_with(SnapshotResponder {
                calls: Arc::new(AtomicUsize::new(0)),
                ready_after: 1,
            })
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/email/sync/updated"))
            .and(query_param("deltaToken", "snap-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [record("e1")],
                "nextPageToken": "p2",
                "nextDeltaToken": "early"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/email/sync/updated"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tokens = Arc::new(MemoryTokenStore::with_account("acc-1", None).await);
        let (session, _dir) = session(&server, tokens.clone()).await;

        let err = session.try_initial_sync().await.expect_err("page failure");
        assert!(matches!(
            err,
            SyncError::Provider(ProviderError::Status { status: 500, .. })
        ));
        assert!(session.perform_initial_sync().await.is_none());
        assert!(tokens.saves.lock().await.is_empty());
        assert_eq!(tokens.load("acc-1").await.expect("load"), None);
    }

    #[tokio::test]
    async fn sync_emails_without_token_is_not_ready_and_skips_provider() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
            .expect(0)
            .mount(&server)
            .await;

        let tokens = Arc::new(MemoryTokenStore::with_account("acc-1", None).await);
        let (session, _dir) = session(&server, tokens).await;

        let err = session.sync_emails().await.expect_err("not ready");
        assert!(matches!(err, SyncError::NotReady(id) if id == "acc-1"));
    }

    #[tokio::test]
    async fn sync_emails_for_unknown_account_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
            .expect(0)
            .mount(&server)
            .await;

        let tokens = Arc::new(MemoryTokenStore::default());
        let (session, _dir) = session(&server, tokens).await;

        let err = session.sync_emails().await.expect_err("missing account");
        assert!(matches!(err, SyncError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn sync_emails_ingests_then_advances_cursor() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "deltaToken",
            "stored",
            json!({"records": [record("e1")], "nextPageToken": "p2"}),
        )
        .await;
        mount_page(
            &server,
            "pageToken",
            "p2",
            json!({"records": [record("e2")], "nextDeltaToken": "next"}),
        )
        .await;

        let tokens = Arc::new(MemoryTokenStore::with_account("acc-1", Some("stored")).await);
        let (session, _dir) = session(&server, tokens.clone()).await;

        let result = session.sync_emails().await.expect("sync");
        assert_eq!(result.batch.emails.len(), 2);
        assert_eq!(result.report.stored(), 2);
        assert_eq!(result.batch.delta_token, "next");
        assert_eq!(
            tokens.saves.lock().await.clone(),
            vec![("acc-1".to_string(), "next".to_string())]
        );
    }

    #[tokio::test]
    async fn undecodable_record_fails_alone_and_cursor_still_advances() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "deltaToken",
            "stored",
            json!({
                "records": [
                    record("good"),
                    {"id": "bad", "threadId": "t-bad", "to": [{"name": "No Address"}]},
                    record("after")
                ],
                "nextDeltaToken": "next"
            }),
        )
        .await;

        let tokens = Arc::new(MemoryTokenStore::with_account("acc-1", Some("stored")).await);
        let (session, _dir) = session(&server, tokens.clone()).await;

        let result = session.sync_emails().await.expect("sync");
        assert_eq!(result.batch.emails.len(), 2);
        assert_eq!(result.batch.rejected.len(), 1);
        assert_eq!(result.report.stored(), 2);
        assert_eq!(result.report.failed(), 1);
        let failures: Vec<_> = result.report.failures().collect();
        assert_eq!(failures[0].0, "bad");
        assert!(matches!(failures[0].1, crate::ingest::IngestError::Decode(_)));
        assert_eq!(
            tokens.load("acc-1").await.expect("load").as_deref(),
            Some("next")
        );
    }
}
