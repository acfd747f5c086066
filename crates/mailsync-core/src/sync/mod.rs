pub mod scheduler;
pub mod session;

pub use scheduler::{SyncService, TickSummary, run_scheduler};
pub use session::{IncrementalSync, SyncBatch, SyncError, SyncSession};
