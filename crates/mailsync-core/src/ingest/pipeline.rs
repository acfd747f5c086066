use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::addresses::{AddressError, AddressRepository, collect_addresses};
use crate::attachments::AttachmentRepository;
use crate::db::Database;
use crate::emails::{EmailError, EmailRepository, EmailWrite, Recipients};
use crate::folder::{FolderLabel, ThreadFolders};
use crate::ingest::indexer::{
    Embedder, NoopEmbedder, NoopIndexer, SearchIndexer, build_document, embedding_input,
    normalize_body,
};
use crate::ingest::limiter::ConcurrencyLimiter;
use crate::provider::{EmailAddress, RawMessage, RejectedRecord};
use crate::threads::{ThreadError, ThreadRepository, ThreadUpsert};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sender {address} could not be stored: {source}")]
    UnresolvableSender {
        address: String,
        #[source]
        source: AddressError,
    },
    #[error("address error: {0}")]
    Address(#[from] AddressError),
    #[error("thread error: {0}")]
    Thread(#[from] ThreadError),
    #[error("email error: {0}")]
    Email(#[from] EmailError),
    #[error("record could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug)]
pub enum MessageOutcome {
    Stored,
    Failed { error: IngestError },
}

#[derive(Debug)]
pub struct MessageReport {
    pub message_id: String,
    pub outcome: MessageOutcome,
}

/// Per-message results of one batch, in batch order.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub messages: Vec<MessageReport>,
}

impl IngestReport {
    pub fn stored(&self) -> usize {
        self.messages
            .iter()
            .filter(|report| matches!(report.outcome, MessageOutcome::Stored))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.messages.len() - self.stored()
    }

    /// Record page entries that never became messages as failed outcomes.
    pub fn record_rejected(&mut self, rejected: &[RejectedRecord]) {
        for record in rejected {
            self.messages.push(MessageReport {
                message_id: record.id.clone().unwrap_or_default(),
                outcome: MessageOutcome::Failed {
                    error: IngestError::Decode(record.error.clone()),
                },
            });
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &IngestError)> {
        self.messages.iter().filter_map(|report| match &report.outcome {
            MessageOutcome::Failed { error } => Some((report.message_id.as_str(), error)),
            MessageOutcome::Stored => None,
        })
    }
}

/// Turns raw provider batches into thread, email, address and attachment rows.
#[derive(Clone)]
pub struct IngestPipeline {
    addresses: AddressRepository,
    threads: ThreadRepository,
    emails: EmailRepository,
    attachments: AttachmentRepository,
    embedder: Arc<dyn Embedder>,
    indexer: Arc<dyn SearchIndexer>,
    limiter: ConcurrencyLimiter,
}

impl IngestPipeline {
    pub fn new(db: Database) -> Self {
        Self {
            addresses: AddressRepository::new(db.clone()),
            threads: ThreadRepository::new(db.clone()),
            emails: EmailRepository::new(db.clone()),
            attachments: AttachmentRepository::new(db),
            embedder: Arc::new(NoopEmbedder),
            indexer: Arc::new(NoopIndexer),
            limiter: ConcurrencyLimiter::default(),
        }
    }

    pub fn with_indexer(
        mut self,
        embedder: Arc<dyn Embedder>,
        indexer: Arc<dyn SearchIndexer>,
    ) -> Self {
        self.embedder = embedder;
        self.indexer = indexer;
        self
    }

    pub fn with_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Store every message of the batch, one at a time, while the indexing
    /// side-work runs alongside under the limiter. A failing message is
    /// recorded in the report and the batch moves on.
    pub async fn ingest(&self, account_id: &str, messages: &[RawMessage]) -> IngestReport {
        let (report, ()) = tokio::join!(
            self.store_all(account_id, messages),
            self.index_all(messages)
        );

        info!(
            account_id,
            total = messages.len(),
            stored = report.stored(),
            failed = report.failed(),
            "ingested batch"
        );
        report
    }

    async fn store_all(&self, account_id: &str, messages: &[RawMessage]) -> IngestReport {
        let mut report = IngestReport::default();
        for message in messages {
            let outcome = match self.store_message(account_id, message).await {
                Ok(()) => MessageOutcome::Stored,
                Err(error) => {
                    warn!(
                        account_id,
                        message_id = %message.id,
                        thread_id = %message.thread_id,
                        error = %error,
                        "failed to store message"
                    );
                    MessageOutcome::Failed { error }
                }
            };
            report.messages.push(MessageReport {
                message_id: message.id.clone(),
                outcome,
            });
        }
        report
    }

    pub async fn store_message(
        &self,
        account_id: &str,
        message: &RawMessage,
    ) -> Result<(), IngestError> {
        let label = FolderLabel::classify(&message.sys_labels);
        let mut resolved = self.resolve_addresses(account_id, message).await;

        let from_id = match resolved.get(&message.from.address) {
            Some(Ok(id)) => id.clone(),
            _ => {
                let source = match resolved.remove(&message.from.address) {
                    Some(Err(err)) => err,
                    _ => AddressError::NotFound(message.from.address.clone()),
                };
                return Err(IngestError::UnresolvableSender {
                    address: message.from.address.clone(),
                    source,
                });
            }
        };

        let ids = |list: &[EmailAddress]| -> Vec<String> {
            let mut out: Vec<String> = Vec::new();
            for address in list {
                if let Some(Ok(id)) = resolved.get(&address.address) {
                    if !out.contains(id) {
                        out.push(id.clone());
                    }
                }
            }
            out
        };
        let recipients = Recipients {
            to: ids(&message.to),
            cc: ids(&message.cc),
            bcc: ids(&message.bcc),
            reply_to: ids(&message.reply_to),
        };

        let mut participants = vec![from_id.clone()];
        for id in recipients
            .to
            .iter()
            .chain(&recipients.cc)
            .chain(&recipients.bcc)
        {
            if !participants.contains(id) {
                participants.push(id.clone());
            }
        }

        self.threads
            .upsert(ThreadUpsert {
                id: &message.thread_id,
                account_id,
                subject: &message.subject,
                last_message_at: message.sent_at,
                participant_ids: &participants,
                folders: ThreadFolders::only(label),
                modified_at: message.last_modified_time(),
            })
            .await?;

        self.emails
            .upsert(
                EmailWrite {
                    message,
                    from_id: &from_id,
                    recipients: &recipients,
                    label,
                },
                &message.thread_id,
            )
            .await?;

        let labels = self.emails.labels_for_thread(&message.thread_id).await?;
        self.threads
            .set_folders(
                &message.thread_id,
                ThreadFolders::from_labels(labels),
                message.last_modified_time(),
            )
            .await?;

        for attachment in &message.attachments {
            if let Err(err) = self.attachments.upsert(&message.id, attachment).await {
                warn!(
                    message_id = %message.id,
                    attachment_id = %attachment.id,
                    error = %err,
                    "failed to store attachment"
                );
            }
        }

        debug!(message_id = %message.id, thread_id = %message.thread_id, label = %label, "stored message");
        Ok(())
    }

    /// Upsert each distinct address once. Failures are kept per address so
    /// the caller can tell a missing sender from a dropped recipient.
    async fn resolve_addresses(
        &self,
        account_id: &str,
        message: &RawMessage,
    ) -> HashMap<String, Result<String, AddressError>> {
        let mut resolved = HashMap::new();
        for address in collect_addresses(message) {
            let result = match self.addresses.upsert(account_id, &address).await {
                Ok(stored) => Ok(stored.id),
                Err(err) => {
                    warn!(
                        account_id,
                        message_id = %message.id,
                        address = %address.address,
                        error = %err,
                        "failed to store address"
                    );
                    Err(err)
                }
            };
            resolved.insert(address.address, result);
        }
        resolved
    }

    async fn index_all(&self, messages: &[RawMessage]) {
        let tasks = messages
            .iter()
            .map(|message| self.limiter.run(self.index_message(message)));
        futures::future::join_all(tasks).await;
    }

    async fn index_message(&self, message: &RawMessage) {
        let body = normalize_body(message);
        let embedding = match self.embedder.embed(&embedding_input(message, &body)).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "failed to embed message");
                return;
            }
        };

        if let Err(err) = self
            .indexer
            .insert(build_document(message, body, embedding))
            .await
        {
            warn!(message_id = %message.id, error = %err, "failed to index message");
        }
    }
}
