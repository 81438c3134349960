#![warn(missing_docs)]
//! Core library entry points for the DFMEA retrieval pipeline.
//!
//! Records from a knowledge bank and from field issue reports are chunked
//! under a token budget, embedded in paced batches, stored in a per-session
//! vector collection, and later retrieved to drive batched structured
//! generation.

pub mod chunker;
pub mod controls;
pub mod embedder;
pub mod embeddings;
pub mod endpoint;
pub mod error;
pub mod generator;
pub mod manifest;
pub mod pipeline;
pub mod records;
pub mod retrieval;
pub mod retry;
pub mod telemetry;
pub mod vector_store;

pub use chunker::{ChunkConfig, ChunkEngine, ChunkMetadata, Cl100kTokenizer, TextChunk, Tokenizer};
pub use embedder::{BatchConfig, EmbedOutcome, EmbeddingBatcher, EmbeddingProvider};
pub use embeddings::{EmbeddedChunk, UsageSummary};
pub use endpoint::{ApiFlavor, ProviderEndpoint};
pub use error::{ConfigError, ProviderError, RecordsError, RetrievalError, StoreError};
pub use generator::{GenerationProvider, GenerationRequest, StructuredEntry};
pub use manifest::{GenerateReport, IngestReport};
pub use pipeline::{IngestSettings, Pipeline, PipelineOutcome};
pub use records::{load_records, Record, Source, SourceFiles};
pub use retrieval::{BatchOutcome, RetrievalConfig, RetrievalOrchestrator, RetrievalRun};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use vector_store::{
    CollectionName, Distance, MemoryIndex, QdrantConfig, QdrantIndex, SearchResult, SessionId,
    VectorIndex, VectorPoint,
};
