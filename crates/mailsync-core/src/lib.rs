pub mod accounts;
pub mod addresses;
pub mod attachments;
pub mod config;
pub mod db;
pub mod delta_token;
pub mod emails;
pub mod folder;
pub mod ingest;
pub mod migrations;
pub mod provider;
pub mod sync;
pub mod telemetry;
pub mod threads;

pub use accounts::{Account, AccountError, AccountRepository, NewAccount};
pub use config::Config;
pub use db::Database;
pub use delta_token::{DeltaTokenError, DeltaTokenStore};
pub use folder::{FolderLabel, ThreadFolders};
pub use ingest::{
    ConcurrencyLimiter, Embedder, IndexDocument, IngestError, IngestPipeline, IngestReport,
    MessageOutcome, SearchIndexer,
};
pub use provider::{ProviderClient, ProviderError, RawMessage, SyncCursor};
pub use sync::{
    IncrementalSync, SyncBatch, SyncError, SyncService, SyncSession, TickSummary, run_scheduler,
};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
