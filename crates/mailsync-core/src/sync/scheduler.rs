use std::sync::Arc;

use futures::StreamExt;
use reqwest::Client;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accounts::{Account, AccountError, AccountRepository};
use crate::config::{ProviderConfig, SyncConfig};
use crate::db::Database;
use crate::ingest::{ConcurrencyLimiter, IngestPipeline};
use crate::provider::ProviderClient;
use crate::sync::session::{SyncError, SyncSession};

const MAX_CONCURRENT_ACCOUNTS: usize = 4;

/// Shared pieces for building per-account sync sessions.
#[derive(Clone)]
pub struct SyncService {
    accounts: AccountRepository,
    pipeline: IngestPipeline,
    http: Client,
    provider: ProviderConfig,
    sync: SyncConfig,
}

/// Outcome of one scheduler pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub messages_stored: usize,
}

impl SyncService {
    pub fn new(db: Database, http: Client, provider: ProviderConfig, sync: SyncConfig) -> Self {
        let pipeline = IngestPipeline::new(db.clone())
            .with_limiter(ConcurrencyLimiter::new(sync.index_concurrency));
        Self {
            accounts: AccountRepository::new(db),
            pipeline,
            http,
            provider,
            sync,
        }
    }

    pub fn with_pipeline(mut self, pipeline: IngestPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn accounts(&self) -> &AccountRepository {
        &self.accounts
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn client(&self, access_token: &str) -> ProviderClient {
        ProviderClient::from_config(self.http.clone(), access_token, &self.provider)
    }

    pub fn session(&self, account: &Account) -> SyncSession {
        SyncSession::new(
            account.id.clone(),
            self.client(&account.access_token),
            Arc::new(self.accounts.clone()),
            self.pipeline.clone(),
        )
        .with_poll_interval(self.sync.readiness_poll_interval())
    }

    /// Look the account up and build its session.
    pub async fn session_for(&self, account_id: &str) -> Result<SyncSession, SyncError> {
        match self.accounts.get_by_id(account_id).await {
            Ok(account) => Ok(self.session(&account)),
            Err(AccountError::NotFound(id)) => Err(SyncError::AccountNotFound(id)),
            Err(other) => Err(SyncError::TokenStore(other.to_string())),
        }
    }

    /// Run an incremental sync for every account that has a cursor.
    pub async fn run_tick(&self) -> Result<TickSummary, AccountError> {
        let accounts = self.accounts.list_syncable().await?;
        let mut summary = TickSummary {
            accounts: accounts.len(),
            ..TickSummary::default()
        };

        let mut results = futures::stream::iter(accounts)
            .map(|account| async move {
                let result = self.session(&account).sync_emails().await;
                (account.id, result)
            })
            .buffer_unordered(MAX_CONCURRENT_ACCOUNTS);

        while let Some((account_id, result)) = results.next().await {
            match result {
                Ok(sync) => {
                    summary.succeeded += 1;
                    summary.messages_stored += sync.report.stored();
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(account_id = %account_id, error = %err, "incremental sync failed");
                }
            }
        }
        Ok(summary)
    }
}

pub async fn run_scheduler(service: SyncService, shutdown: CancellationToken) {
    let interval = service.sync.tick_interval();
    info!(interval_secs = interval.as_secs(), "sync scheduler started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match service.run_tick().await {
            Ok(summary) if summary.accounts > 0 => info!(
                accounts = summary.accounts,
                succeeded = summary.succeeded,
                failed = summary.failed,
                stored = summary.messages_stored,
                "sync tick finished"
            ),
            Ok(_) => {}
            Err(err) => error!(error = %err, "failed to list accounts for sync"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }

    info!("sync scheduler stopped");
}
