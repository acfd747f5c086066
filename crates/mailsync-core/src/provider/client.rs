use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::config::{DEFAULT_PROVIDER_API_BASE, ProviderConfig};
use crate::provider::types::{AccountDetails, OutgoingEmail, SnapshotStatus, SyncPage};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("provider rejected the access token")]
    Unauthorized,
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Where to resume reading `/email/sync/updated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCursor {
    /// Start of a sync generation.
    Delta(String),
    /// Continuation inside the current generation.
    Page(String),
}

impl SyncCursor {
    fn query_pair(&self) -> (&'static str, &str) {
        match self {
            SyncCursor::Delta(token) => ("deltaToken", token),
            SyncCursor::Page(token) => ("pageToken", token),
        }
    }
}

/// Authenticated client for one account's mailbox.
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    access_token: String,
    api_base: String,
    days_within: u32,
    body_type: String,
}

impl ProviderClient {
    pub fn new(http: Client, access_token: impl Into<String>) -> Self {
        Self {
            http,
            access_token: access_token.into(),
            api_base: DEFAULT_PROVIDER_API_BASE.to_string(),
            days_within: 1,
            body_type: "html".to_string(),
        }
    }

    pub fn from_config(http: Client, access_token: impl Into<String>, config: &ProviderConfig) -> Self {
        Self {
            http,
            access_token: access_token.into(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            days_within: config.days_within,
            body_type: config.body_type.clone(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Ask the provider to prepare a snapshot. The answer may not be ready yet.
    pub async fn start_snapshot(&self) -> Result<SnapshotStatus, ProviderError> {
        let url = format!("{}/email/sync", self.api_base);
        let days_within = self.days_within.to_string();
        self.send_json(
            self.http
                .post(&url)
                .query(&[
                    ("daysWithin", days_within.as_str()),
                    ("bodyType", self.body_type.as_str()),
                ])
                .json(&serde_json::json!({})),
        )
        .await
    }

    pub async fn fetch_page(&self, cursor: &SyncCursor) -> Result<SyncPage, ProviderError> {
        let url = format!("{}/email/sync/updated", self.api_base);
        self.send_json(self.http.get(&url).query(&[cursor.query_pair()]))
            .await
    }

    pub async fn send_email(&self, email: &OutgoingEmail) -> Result<Value, ProviderError> {
        let url = format!("{}/email/messages", self.api_base);
        let mut body = serde_json::to_value(email)?;
        if let (Some(reply_to), Value::Object(map)) = (&email.reply_to, &mut body) {
            map.insert("replyTo".into(), serde_json::to_value(vec![reply_to])?);
        }

        let response = self
            .send_json::<Value>(
                self.http
                    .post(&url)
                    .query(&[("returnIds", "true")])
                    .json(&body),
            )
            .await;
        match &response {
            Ok(_) => tracing::info!(subject = %email.subject, "email sent"),
            Err(err) => tracing::error!(error = %err, "error sending email"),
        }
        response
    }

    pub async fn account_details(&self) -> Result<AccountDetails, ProviderError> {
        let url = format!("{}/account", self.api_base);
        self.send_json(self.http.get(&url)).await
    }

    async fn send_json<T>(&self, builder: reqwest::RequestBuilder) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
    {
        let response = builder.bearer_auth(&self.access_token).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Unauthorized);
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(ProviderError::Decode)
    }
}
