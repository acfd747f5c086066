use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::provider::RawMessage;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("index insert failed: {0}")]
    Insert(String),
}

/// Document handed to the downstream search index for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub subject: String,
    pub body: String,
    pub from: String,
    pub to: Vec<String>,
    pub thread_id: String,
    pub sent_at: DateTime<Utc>,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;
}

#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn insert(&self, document: IndexDocument) -> Result<(), IndexError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmbedder;

#[async_trait]
impl Embedder for NoopEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, IndexError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexer;

#[async_trait]
impl SearchIndexer for NoopIndexer {
    async fn insert(&self, _document: IndexDocument) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Plain-text body for indexing: rendered HTML, else the snippet, else empty.
pub fn normalize_body(message: &RawMessage) -> String {
    if let Some(html) = message.body.as_deref().filter(|body| !body.trim().is_empty()) {
        return strip_html(html);
    }
    message.body_snippet.clone().unwrap_or_default()
}

fn strip_html(html: &str) -> String {
    let mut bytes = std::io::Cursor::new(html.as_bytes());
    html2text::from_read(&mut bytes, 80)
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn embedding_input(message: &RawMessage, body: &str) -> String {
    format!(
        "From: {}\nSubject: {}\n\n{}",
        message.from.address, message.subject, body
    )
}

pub fn build_document(message: &RawMessage, body: String, embedding: Vec<f32>) -> IndexDocument {
    IndexDocument {
        subject: message.subject.clone(),
        body,
        from: message.from.address.clone(),
        to: message.to.iter().map(|to| to.address.clone()).collect(),
        thread_id: message.thread_id.clone(),
        sent_at: message.sent_at,
        embedding,
    }
}
