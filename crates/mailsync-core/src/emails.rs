use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, TransactionBehavior, params};
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::folder::{FolderLabel, UnknownFolderLabel};
use crate::provider::{EmailHeader, RawMessage};

const EMAIL_COLUMNS: &str = "id, thread_id, created_time, last_modified_time, sent_at, received_at, internet_message_id, subject, sys_labels_json, keywords_json, sys_classifications_json, sensitivity, meeting_message_method, from_id, has_attachments, body, body_snippet, in_reply_to, message_references, thread_index, internet_headers_json, native_properties_json, folder_id, omitted_json, email_label";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
    ReplyTo,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::To => "to",
            RecipientKind::Cc => "cc",
            RecipientKind::Bcc => "bcc",
            RecipientKind::ReplyTo => "reply_to",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown recipient kind: {0}")]
pub struct UnknownRecipientKind(pub String);

impl FromStr for RecipientKind {
    type Err = UnknownRecipientKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "to" => Ok(RecipientKind::To),
            "cc" => Ok(RecipientKind::Cc),
            "bcc" => Ok(RecipientKind::Bcc),
            "reply_to" => Ok(RecipientKind::ReplyTo),
            other => Err(UnknownRecipientKind(other.to_string())),
        }
    }
}

/// Address row ids per recipient set, in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
}

impl Recipients {
    fn sets(&self) -> [(RecipientKind, &[String]); 4] {
        [
            (RecipientKind::To, self.to.as_slice()),
            (RecipientKind::Cc, self.cc.as_slice()),
            (RecipientKind::Bcc, self.bcc.as_slice()),
            (RecipientKind::ReplyTo, self.reply_to.as_slice()),
        ]
    }

    fn set_mut(&mut self, kind: RecipientKind) -> &mut Vec<String> {
        match kind {
            RecipientKind::To => &mut self.to,
            RecipientKind::Cc => &mut self.cc,
            RecipientKind::Bcc => &mut self.bcc,
            RecipientKind::ReplyTo => &mut self.reply_to,
        }
    }
}

/// Everything needed to write one email row and its recipient links.
#[derive(Debug, Clone)]
pub struct EmailWrite<'a> {
    pub message: &'a RawMessage,
    pub from_id: &'a str,
    pub recipients: &'a Recipients,
    pub label: FolderLabel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEmail {
    pub id: String,
    pub thread_id: String,
    pub created_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub internet_message_id: String,
    pub subject: String,
    pub sys_labels: Vec<String>,
    pub keywords: Vec<String>,
    pub sys_classifications: Vec<String>,
    pub sensitivity: String,
    pub meeting_message_method: Option<String>,
    pub from_id: String,
    pub recipients: Recipients,
    pub has_attachments: bool,
    pub body: Option<String>,
    pub body_snippet: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub thread_index: Option<String>,
    pub internet_headers: Vec<EmailHeader>,
    pub native_properties: BTreeMap<String, String>,
    pub folder_id: Option<String>,
    pub omitted: Vec<String>,
    pub label: FolderLabel,
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("{0}")]
    Label(#[from] UnknownFolderLabel),
    #[error("{0}")]
    RecipientKind(#[from] UnknownRecipientKind),
    #[error("email not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct EmailRepository {
    db: Database,
}

impl EmailRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or fully replace an email. Every column is overwritten from the
    /// provider record and the recipient links are rebuilt in the same
    /// transaction.
    pub async fn upsert(&self, email: EmailWrite<'_>, thread_id: &str) -> Result<(), EmailError> {
        let message = email.message;
        let conn = self.db.connection().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        tx.execute(
            &format!(
                "INSERT INTO emails ({EMAIL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
                 ON CONFLICT(id) DO UPDATE SET
                    thread_id = excluded.thread_id,
                    created_time = excluded.created_time,
                    last_modified_time = excluded.last_modified_time,
                    sent_at = excluded.sent_at,
                    received_at = excluded.received_at,
                    internet_message_id = excluded.internet_message_id,
                    subject = excluded.subject,
                    sys_labels_json = excluded.sys_labels_json,
                    keywords_json = excluded.keywords_json,
                    sys_classifications_json = excluded.sys_classifications_json,
                    sensitivity = excluded.sensitivity,
                    meeting_message_method = excluded.meeting_message_method,
                    from_id = excluded.from_id,
                    has_attachments = excluded.has_attachments,
                    body = excluded.body,
                    body_snippet = excluded.body_snippet,
                    in_reply_to = excluded.in_reply_to,
                    message_references = excluded.message_references,
                    thread_index = excluded.thread_index,
                    internet_headers_json = excluded.internet_headers_json,
                    native_properties_json = excluded.native_properties_json,
                    folder_id = excluded.folder_id,
                    omitted_json = excluded.omitted_json,
                    email_label = excluded.email_label"
            ),
            params![
                message.id.as_str(),
                thread_id,
                to_rfc3339(message.created_time()),
                to_rfc3339(message.last_modified_time()),
                to_rfc3339(message.sent_at),
                to_rfc3339(message.received_at()),
                message.internet_message_id.as_str(),
                message.subject.as_str(),
                serde_json::to_string(&message.sys_labels)?,
                serde_json::to_string(&message.keywords)?,
                serde_json::to_string(&message.sys_classifications)?,
                message.sensitivity.as_str(),
                message.meeting_message_method.clone(),
                email.from_id,
                message.has_attachments as i64,
                message.body.clone(),
                message.body_snippet.clone(),
                message.in_reply_to.clone(),
                message.references.clone(),
                message.thread_index.clone(),
                serde_json::to_string(&message.internet_headers)?,
                serde_json::to_string(&message.native_properties)?,
                message.folder_id.clone(),
                serde_json::to_string(&message.omitted)?,
                email.label.as_str()
            ],
        )
        .await?;

        tx.execute(
            "DELETE FROM email_recipients WHERE email_id = ?1",
            params![message.id.as_str()],
        )
        .await?;
        for (kind, ids) in email.recipients.sets() {
            for (position, address_id) in ids.iter().enumerate() {
                tx.execute(
                    "INSERT OR IGNORE INTO email_recipients (email_id, kind, position, address_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        message.id.as_str(),
                        kind.as_str(),
                        position as i64,
                        address_id.as_str()
                    ],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<StoredEmail, EmailError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                params![id],
            )
            .await?;
        let mut email = match rows.next().await? {
            Some(row) => row_to_email(row)?,
            None => return Err(EmailError::NotFound(id.to_string())),
        };

        let mut rows = conn
            .query(
                "SELECT kind, address_id FROM email_recipients WHERE email_id = ?1 ORDER BY kind, position",
                params![id],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let kind: RecipientKind = row.get::<String>(0)?.parse()?;
            email.recipients.set_mut(kind).push(row.get(1)?);
        }
        Ok(email)
    }

    /// Folder labels of a thread's emails, oldest received first.
    pub async fn labels_for_thread(&self, thread_id: &str) -> Result<Vec<FolderLabel>, EmailError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT email_label FROM emails WHERE thread_id = ?1 ORDER BY received_at ASC, id ASC",
                params![thread_id],
            )
            .await?;

        let mut labels = Vec::new();
        while let Some(row) = rows.next().await? {
            labels.push(row.get::<String>(0)?.parse()?);
        }
        Ok(labels)
    }
}

fn row_to_email(row: Row) -> Result<StoredEmail, EmailError> {
    let timestamp = |index: i32| -> Result<DateTime<Utc>, EmailError> {
        let value: String = row.get(index)?;
        Ok(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc))
    };
    let json_list = |index: i32| -> Result<Vec<String>, EmailError> {
        Ok(serde_json::from_str(&row.get::<String>(index)?)?)
    };

    Ok(StoredEmail {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        created_time: timestamp(2)?,
        last_modified_time: timestamp(3)?,
        sent_at: timestamp(4)?,
        received_at: timestamp(5)?,
        internet_message_id: row.get(6)?,
        subject: row.get(7)?,
        sys_labels: json_list(8)?,
        keywords: json_list(9)?,
        sys_classifications: json_list(10)?,
        sensitivity: row.get(11)?,
        meeting_message_method: row.get(12)?,
        from_id: row.get(13)?,
        recipients: Recipients::default(),
        has_attachments: row.get::<i64>(14)? != 0,
        body: row.get(15)?,
        body_snippet: row.get(16)?,
        in_reply_to: row.get(17)?,
        references: row.get(18)?,
        thread_index: row.get(19)?,
        internet_headers: serde_json::from_str(&row.get::<String>(20)?)?,
        native_properties: serde_json::from_str(&row.get::<String>(21)?)?,
        folder_id: row.get(22)?,
        omitted: json_list(23)?,
        label: row.get::<String>(24)?.parse()?,
    })
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::tests::{seed_account, setup_db};
    use crate::addresses::AddressRepository;
    use crate::folder::ThreadFolders;
    use crate::provider::EmailAddress;
    use crate::threads::{ThreadRepository, ThreadUpsert};
    use serde_json::json;

    struct Fixture {
        repo: EmailRepository,
        ids: BTreeMap<&'static str, String>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (db, dir) = setup_db().await;
        seed_account(&db, "acc-1").await;
        let addresses = AddressRepository::new(db.clone());
        let mut ids = BTreeMap::new();
        for address in ["a@x.com", "b@x.com", "c@x.com"] {
            let stored = addresses
                .upsert("acc-1", &EmailAddress::new(address))
                .await
                .expect("address");
            ids.insert(address, stored.id);
        }
        ThreadRepository::new(db.clone())
            .upsert(ThreadUpsert {
                id: "t1",
                account_id: "acc-1",
                subject: "Subject",
                last_message_at: Utc::now(),
                participant_ids: &[],
                folders: ThreadFolders::only(FolderLabel::Inbox),
                modified_at: Utc::now(),
            })
            .await
            .expect("thread");

        Fixture {
            repo: EmailRepository::new(db),
            ids,
            _dir: dir,
        }
    }

    fn message(id: &str, received: &str, labels: &[&str]) -> RawMessage {
        serde_json::from_value(json!({
            "id": id,
            "threadId": "t1",
            "sentAt": "2024-01-01T00:00:00Z",
            "receivedAt": received,
            "lastModifiedTime": "2024-01-01T00:10:00Z",
            "subject": "Subject",
            "sysLabels": labels,
            "from": {"address": "a@x.com"},
            "body": "<p>body</p>",
            "nativeProperties": {"b": "2", "a": "1"}
        }))
        .expect("message")
    }

    #[tokio::test]
    async fn upsert_replaces_fields_and_recipients() {
        let f = fixture().await;
        let first = message("e1", "2024-01-01T00:00:01Z", &["inbox"]);
        let recipients = Recipients {
            to: vec![f.ids["b@x.com"].clone()],
            cc: vec![f.ids["c@x.com"].clone()],
            ..Recipients::default()
        };
        f.repo
            .upsert(
                EmailWrite {
                    message: &first,
                    from_id: &f.ids["a@x.com"],
                    recipients: &recipients,
                    label: FolderLabel::Inbox,
                },
                "t1",
            )
            .await
            .expect("insert");

        let mut second = first.clone();
        second.subject = "Edited".into();
        second.body = None;
        let replaced = Recipients {
            to: vec![f.ids["c@x.com"].clone()],
            ..Recipients::default()
        };
        f.repo
            .upsert(
                EmailWrite {
                    message: &second,
                    from_id: &f.ids["a@x.com"],
                    recipients: &replaced,
                    label: FolderLabel::Sent,
                },
                "t1",
            )
            .await
            .expect("replace");

        let stored = f.repo.get("e1").await.expect("get");
        assert_eq!(stored.subject, "Edited");
        assert!(stored.body.is_none(), "absent fields are cleared, not merged");
        assert_eq!(stored.recipients, replaced);
        assert_eq!(stored.label, FolderLabel::Sent);
        assert_eq!(
            stored.last_modified_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            "2024-01-01T00:10:00Z"
        );
        assert_eq!(stored.native_properties.get("a").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn labels_for_thread_are_ordered_by_receive_time() {
        let f = fixture().await;
        let from = f.ids["a@x.com"].clone();
        let none = Recipients::default();
        for (id, received, label) in [
            ("late", "2024-01-03T00:00:00Z", FolderLabel::Draft),
            ("early", "2024-01-01T00:00:00Z", FolderLabel::Inbox),
            ("middle", "2024-01-02T00:00:00Z", FolderLabel::Sent),
        ] {
            let msg = message(id, received, &[]);
            f.repo
                .upsert(
                    EmailWrite {
                        message: &msg,
                        from_id: &from,
                        recipients: &none,
                        label,
                    },
                    "t1",
                )
                .await
                .expect("insert");
        }

        let labels = f.repo.labels_for_thread("t1").await.expect("labels");
        assert_eq!(
            labels,
            vec![FolderLabel::Inbox, FolderLabel::Sent, FolderLabel::Draft]
        );
    }

    #[tokio::test]
    async fn missing_email_is_not_found() {
        let f = fixture().await;
        let err = f.repo.get("nope").await.expect_err("missing");
        assert!(matches!(err, EmailError::NotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn unknown_recipient_kind_is_an_error() {
        let f = fixture().await;
        let msg = message("e1", "2024-01-01T00:00:01Z", &["inbox"]);
        let recipients = Recipients {
            to: vec![f.ids["b@x.com"].clone()],
            ..Recipients::default()
        };
        f.repo
            .upsert(
                EmailWrite {
                    message: &msg,
                    from_id: &f.ids["a@x.com"],
                    recipients: &recipients,
                    label: FolderLabel::Inbox,
                },
                "t1",
            )
            .await
            .expect("insert");

        let conn = f.repo.db.connection().await.expect("conn");
        conn.execute("UPDATE email_recipients SET kind = 'resent_to'", ())
            .await
            .expect("corrupt kind");

        let err = f.repo.get("e1").await.expect_err("bad kind");
        assert!(matches!(err, EmailError::RecipientKind(UnknownRecipientKind(kind)) if kind == "resent_to"));
    }

    #[test]
    fn recipient_kind_round_trips_through_storage_names() {
        for kind in [
            RecipientKind::To,
            RecipientKind::Cc,
            RecipientKind::Bcc,
            RecipientKind::ReplyTo,
        ] {
            assert_eq!(kind.as_str().parse::<RecipientKind>(), Ok(kind));
        }
    }
}
