use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Some providers omit the address on group or undisclosed entries.
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            raw: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    #[serde(default)]
    pub inline: bool,
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailHeader {
    pub name: String,
    pub value: String,
}

/// A message record as delivered by `/email/sync/updated`.
///
/// Only `id`, `threadId`, `from` and `sentAt` are required; the remaining
/// timestamps fall back to `sentAt` when the provider omits them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_time: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub internet_message_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub sys_labels: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sys_classifications: Vec<String>,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: String,
    #[serde(default)]
    pub meeting_message_method: Option<String>,
    pub from: EmailAddress,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    #[serde(default)]
    pub reply_to: Vec<EmailAddress>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_snippet: Option<String>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Option<String>,
    #[serde(default)]
    pub thread_index: Option<String>,
    #[serde(default)]
    pub internet_headers: Vec<EmailHeader>,
    #[serde(default)]
    pub native_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub omitted: Vec<String>,
}

fn default_sensitivity() -> String {
    "normal".to_string()
}

impl RawMessage {
    pub fn created_time(&self) -> DateTime<Utc> {
        self.created_time.unwrap_or(self.sent_at)
    }

    pub fn last_modified_time(&self) -> DateTime<Utc> {
        self.last_modified_time.unwrap_or(self.sent_at)
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at.unwrap_or(self.sent_at)
    }
}

/// Response of `POST /email/sync`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    pub ready: bool,
    #[serde(default)]
    pub sync_updated_token: Option<String>,
    #[serde(default)]
    pub sync_deleted_token: Option<String>,
}

/// One page of `GET /email/sync/updated`.
///
/// Records stay as raw JSON until [`SyncPage::take_messages`] so one
/// malformed record cannot fail the whole page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub next_delta_token: Option<String>,
    #[serde(default)]
    pub records: Vec<Value>,
}

/// A page record that could not be read as a [`RawMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub id: Option<String>,
    pub error: String,
}

impl SyncPage {
    /// Drain the page's records, splitting them into decoded messages and
    /// rejects. Order is preserved within each list.
    pub fn take_messages(&mut self) -> (Vec<RawMessage>, Vec<RejectedRecord>) {
        let mut messages = Vec::with_capacity(self.records.len());
        let mut rejected = Vec::new();
        for record in std::mem::take(&mut self.records) {
            let id = record.get("id").and_then(Value::as_str).map(str::to_string);
            match serde_json::from_value::<RawMessage>(record) {
                Ok(message) => messages.push(message),
                Err(err) => rejected.push(RejectedRecord {
                    id,
                    error: err.to_string(),
                }),
            }
        }
        (messages, rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountDetails {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEmail {
    pub from: EmailAddress,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    /// Sent to the provider as a one-element list when present.
    #[serde(default, skip_serializing)]
    pub reply_to: Option<EmailAddress>,
}
