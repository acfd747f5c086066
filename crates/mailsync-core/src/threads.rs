use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, TransactionBehavior, params};
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::folder::ThreadFolders;

const THREAD_COLUMNS: &str = "id, account_id, subject, last_message_at, participant_ids_json, done, inbox_status, draft_status, sent_status, created_at, updated_at";

#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    /// Provider conversation id.
    pub id: String,
    pub account_id: String,
    pub subject: String,
    pub last_message_at: DateTime<Utc>,
    pub participant_ids: Vec<String>,
    pub done: bool,
    pub folders: ThreadFolders,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ThreadUpsert<'a> {
    pub id: &'a str,
    pub account_id: &'a str,
    pub subject: &'a str,
    pub last_message_at: DateTime<Utc>,
    pub participant_ids: &'a [String],
    /// Applied only when the thread is created.
    pub folders: ThreadFolders,
    /// Provider modification time of the message being ingested. Becomes
    /// `updated_at` when this upsert changes the row.
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("thread not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ThreadRepository {
    db: Database,
}

impl ThreadRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create or merge a thread. Participants are unioned with the stored set,
    /// `last_message_at` only moves forward, `done` is cleared and the subject
    /// replaced. Folder flags are left alone on existing threads.
    ///
    /// The write lock is taken before the participant read so concurrent
    /// writers queue on the busy timeout instead of failing the upgrade.
    pub async fn upsert(&self, thread: ThreadUpsert<'_>) -> Result<Thread, ThreadError> {
        let now = to_rfc3339(Utc::now());
        let conn = self.db.connection().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        let mut participants: Vec<String> = {
            let mut rows = tx
                .query(
                    "SELECT participant_ids_json FROM threads WHERE id = ?1",
                    params![thread.id],
                )
                .await?;
            match rows.next().await? {
                Some(row) => serde_json::from_str(&row.get::<String>(0)?)?,
                None => Vec::new(),
            }
        };
        for id in thread.participant_ids {
            if !participants.contains(id) {
                participants.push(id.clone());
            }
        }
        let participants_json = serde_json::to_string(&participants)?;

        let mut rows = tx
            .query(
                &format!(
                    "INSERT INTO threads (id, account_id, subject, last_message_at, participant_ids_json, done, inbox_status, draft_status, sent_status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        subject = excluded.subject,
                        last_message_at = CASE
                            WHEN excluded.last_message_at > threads.last_message_at THEN excluded.last_message_at
                            ELSE threads.last_message_at
                        END,
                        participant_ids_json = excluded.participant_ids_json,
                        done = 0,
                        updated_at = CASE
                            WHEN threads.subject IS NOT excluded.subject
                              OR excluded.last_message_at > threads.last_message_at
                              OR threads.participant_ids_json IS NOT excluded.participant_ids_json
                              OR threads.done <> 0
                            THEN excluded.updated_at
                            ELSE threads.updated_at
                        END
                     RETURNING {THREAD_COLUMNS}"
                ),
                params![
                    thread.id,
                    thread.account_id,
                    thread.subject,
                    to_rfc3339(thread.last_message_at),
                    participants_json,
                    thread.folders.inbox as i64,
                    thread.folders.draft as i64,
                    thread.folders.sent as i64,
                    now,
                    to_rfc3339(thread.modified_at)
                ],
            )
            .await?;

        let stored = match rows.next().await? {
            Some(row) => row_to_thread(row)?,
            None => return Err(ThreadError::NotFound(thread.id.to_string())),
        };
        drop(rows);
        tx.commit().await?;
        Ok(stored)
    }

    /// Overwrite the folder flags. `updated_at` moves to `modified_at` only
    /// when a flag actually changes.
    pub async fn set_folders(
        &self,
        thread_id: &str,
        folders: ThreadFolders,
        modified_at: DateTime<Utc>,
    ) -> Result<Thread, ThreadError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE threads
                     SET inbox_status = ?1, draft_status = ?2, sent_status = ?3,
                         updated_at = CASE
                            WHEN inbox_status <> ?1 OR draft_status <> ?2 OR sent_status <> ?3 THEN ?4
                            ELSE updated_at
                         END
                     WHERE id = ?5
                     RETURNING {THREAD_COLUMNS}"
                ),
                params![
                    folders.inbox as i64,
                    folders.draft as i64,
                    folders.sent as i64,
                    to_rfc3339(modified_at),
                    thread_id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_thread(row),
            None => Err(ThreadError::NotFound(thread_id.to_string())),
        }
    }

    pub async fn get(&self, thread_id: &str) -> Result<Thread, ThreadError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![thread_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_thread(row),
            None => Err(ThreadError::NotFound(thread_id.to_string())),
        }
    }
}

fn row_to_thread(row: Row) -> Result<Thread, ThreadError> {
    let last_message_at: String = row.get(3)?;
    let participant_ids_json: String = row.get(4)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Thread {
        id: row.get(0)?,
        account_id: row.get(1)?,
        subject: row.get(2)?,
        last_message_at: DateTime::parse_from_rfc3339(&last_message_at)?.with_timezone(&Utc),
        participant_ids: serde_json::from_str(&participant_ids_json)?,
        done: row.get::<i64>(5)? != 0,
        folders: ThreadFolders {
            inbox: row.get::<i64>(6)? != 0,
            draft: row.get::<i64>(7)? != 0,
            sent: row.get::<i64>(8)? != 0,
        },
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
