use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::delta_token::{DeltaTokenError, DeltaTokenStore};

const ACCOUNT_COLUMNS: &str =
    "id, user_id, email_address, name, access_token, next_delta_token, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Provider-assigned account id.
    pub id: String,
    pub user_id: String,
    pub email_address: String,
    pub name: Option<String>,
    pub access_token: String,
    pub next_delta_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a credential is linked to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub id: String,
    pub user_id: String,
    pub email_address: String,
    pub name: Option<String>,
    pub access_token: String,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("account not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct AccountRepository {
    db: Database,
}

impl AccountRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the account row, or on relink replace only its access token.
    pub async fn upsert_linked(&self, account: NewAccount) -> Result<Account, AccountError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO accounts (id, user_id, email_address, name, access_token, next_delta_token, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        access_token = excluded.access_token,
                        updated_at = excluded.updated_at
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![
                    account.id.clone(),
                    account.user_id,
                    account.email_address,
                    account.name,
                    account.access_token,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(account.id)),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    /// Lookup scoped to the owning user; another user's account is reported as missing.
    pub async fn get_for_user(&self, id: &str, user_id: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1 AND user_id = ?2"),
                params![id, user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Account>, AccountError> {
        self.list_where("1 = 1").await
    }

    /// Accounts that have finished an initial sync and can be synced incrementally.
    pub async fn list_syncable(&self) -> Result<Vec<Account>, AccountError> {
        self.list_where("next_delta_token IS NOT NULL").await
    }

    async fn list_where(&self, filter: &str) -> Result<Vec<Account>, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {filter} ORDER BY created_at, id"
                ),
                (),
            )
            .await?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await? {
            accounts.push(row_to_account(row)?);
        }
        Ok(accounts)
    }

    pub async fn set_delta_token(&self, id: &str, token: &str) -> Result<(), AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE accounts SET next_delta_token = ?1, updated_at = ?2 WHERE id = ?3 RETURNING id",
                params![token, now_rfc3339(), id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl DeltaTokenStore for AccountRepository {
    async fn load(&self, account_id: &str) -> Result<Option<String>, DeltaTokenError> {
        match self.get_by_id(account_id).await {
            Ok(account) => Ok(account.next_delta_token),
            Err(err) => Err(to_token_error(err)),
        }
    }

    async fn save(&self, account_id: &str, token: &str) -> Result<(), DeltaTokenError> {
        self.set_delta_token(account_id, token)
            .await
            .map_err(to_token_error)
    }
}

fn to_token_error(err: AccountError) -> DeltaTokenError {
    match err {
        AccountError::NotFound(id) => DeltaTokenError::AccountNotFound(id),
        other => DeltaTokenError::Storage(other.to_string()),
    }
}

fn row_to_account(row: Row) -> Result<Account, AccountError> {
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        email_address: row.get(2)?,
        name: row.get(3)?,
        access_token: row.get(4)?,
        next_delta_token: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
