use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::provider::{EmailAddress, RawMessage};

const ADDRESS_COLUMNS: &str = "id, account_id, address, name, raw, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAddress {
    pub id: String,
    pub account_id: String,
    pub address: String,
    pub name: Option<String>,
    pub raw: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("address upsert returned no row: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct AddressRepository {
    db: Database,
}

impl AddressRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Keyed by (account, address). Existing rows keep their id; a present
    /// name or raw form replaces the stored one. `updated_at` only moves when
    /// one of them actually changes.
    pub async fn upsert(
        &self,
        account_id: &str,
        address: &EmailAddress,
    ) -> Result<StoredAddress, AddressError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO email_addresses (id, account_id, address, name, raw, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(account_id, address) DO UPDATE SET
                        name = COALESCE(excluded.name, email_addresses.name),
                        raw = COALESCE(excluded.raw, email_addresses.raw),
                        updated_at = CASE
                            WHEN COALESCE(excluded.name, email_addresses.name) IS NOT email_addresses.name
                              OR COALESCE(excluded.raw, email_addresses.raw) IS NOT email_addresses.raw
                            THEN excluded.updated_at
                            ELSE email_addresses.updated_at
                        END
                     RETURNING {ADDRESS_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    account_id,
                    address.address.as_str(),
                    address.name.clone(),
                    address.raw.clone(),
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_address(row),
            None => Err(AddressError::NotFound(address.address.clone())),
        }
    }

    pub async fn get(&self, account_id: &str, address: &str) -> Result<StoredAddress, AddressError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ADDRESS_COLUMNS} FROM email_addresses WHERE account_id = ?1 AND address = ?2"
                ),
                params![account_id, address],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_address(row),
            None => Err(AddressError::NotFound(address.to_string())),
        }
    }
}

/// Every address a message mentions (from, to, cc, bcc, reply-to), one entry
/// per address string in first-seen order.
pub fn collect_addresses(message: &RawMessage) -> Vec<EmailAddress> {
    let mut unique: Vec<EmailAddress> = Vec::new();
    let all = std::iter::once(&message.from)
        .chain(&message.to)
        .chain(&message.cc)
        .chain(&message.bcc)
        .chain(&message.reply_to);

    for address in all {
        match unique.iter_mut().find(|seen| seen.address == address.address) {
            Some(seen) => {
                if address.name.is_some() {
                    seen.name = address.name.clone();
                }
                if address.raw.is_some() {
                    seen.raw = address.raw.clone();
                }
            }
            None => unique.push(address.clone()),
        }
    }
    unique
}

fn row_to_address(row: Row) -> Result<StoredAddress, AddressError> {
    Ok(StoredAddress {
        id: row.get(0)?,
        account_id: row.get(1)?,
        address: row.get(2)?,
        name: row.get(3)?,
        raw: row.get(4)?,
        updated_at: DateTime::parse_from_rfc3339(&row.get::<String>(5)?)?.with_timezone(&Utc),
    })
}
