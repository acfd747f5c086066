pub mod client;
pub mod types;

pub use client::{ProviderClient, ProviderError, SyncCursor};
pub use types::*;
