use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeltaTokenError {
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("token storage error: {0}")]
    Storage(String),
}

/// Persists the single resumption cursor of an account.
///
/// A missing token means the account has never completed an initial sync.
/// Writers only call [`DeltaTokenStore::save`] once a page chain has been
/// fully traversed.
#[async_trait]
pub trait DeltaTokenStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<String>, DeltaTokenError>;

    async fn save(&self, account_id: &str, token: &str) -> Result<(), DeltaTokenError>;
}
