pub mod indexer;
pub mod limiter;
pub mod pipeline;

pub use indexer::{
    Embedder, IndexDocument, IndexError, NoopEmbedder, NoopIndexer, SearchIndexer, normalize_body,
};
pub use limiter::{ConcurrencyLimiter, DEFAULT_INDEX_CONCURRENCY};
pub use pipeline::{IngestError, IngestPipeline, IngestReport, MessageOutcome, MessageReport};
