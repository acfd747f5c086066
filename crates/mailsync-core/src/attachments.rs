use libsql::{Row, params};
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::provider::EmailAttachment;

const ATTACHMENT_COLUMNS: &str =
    "id, email_id, name, mime_type, size, inline, content_id, content, content_location";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub id: String,
    pub email_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub inline: bool,
    pub content_id: Option<String>,
    pub content: Option<String>,
    pub content_location: Option<String>,
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
}

#[derive(Clone)]
pub struct AttachmentRepository {
    db: Database,
}

impl AttachmentRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        email_id: &str,
        attachment: &EmailAttachment,
    ) -> Result<(), AttachmentError> {
        let conn = self.db.connection().await?;
        conn.execute(
            &format!(
                "INSERT INTO attachments ({ATTACHMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    email_id = excluded.email_id,
                    name = excluded.name,
                    mime_type = excluded.mime_type,
                    size = excluded.size,
                    inline = excluded.inline,
                    content_id = excluded.content_id,
                    content = excluded.content,
                    content_location = excluded.content_location"
            ),
            params![
                attachment.id.as_str(),
                email_id,
                attachment.name.as_str(),
                attachment.mime_type.as_str(),
                attachment.size,
                attachment.inline as i64,
                attachment.content_id.clone(),
                attachment.content.clone(),
                attachment.content_location.clone()
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn list_for_email(
        &self,
        email_id: &str,
    ) -> Result<Vec<StoredAttachment>, AttachmentError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE email_id = ?1 ORDER BY id"
                ),
                params![email_id],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(row_to_attachment(row)?);
        }
        Ok(attachments)
    }
}

fn row_to_attachment(row: Row) -> Result<StoredAttachment, AttachmentError> {
    Ok(StoredAttachment {
        id: row.get(0)?,
        email_id: row.get(1)?,
        name: row.get(2)?,
        mime_type: row.get(3)?,
        size: row.get(4)?,
        inline: row.get::<i64>(5)? != 0,
        content_id: row.get(6)?,
        content: row.get(7)?,
        content_location: row.get(8)?,
    })
}
