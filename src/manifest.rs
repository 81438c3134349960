//! Run reports emitted by the ingest and generate stages.

use serde::Serialize;

use crate::chunker::ChunkStats;
use crate::embedder::EmbedOutcome;
use crate::retrieval::RetrievalRun;
use crate::vector_store::{CollectionName, UpsertReport};

/// Summary of one ingest run: what was read, sliced, embedded and stored.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Collection the points were written to.
    pub collection: String,
    /// Knowledge bank rows loaded.
    pub knowledge_bank_records: usize,
    /// Field issue rows loaded.
    pub field_issue_records: usize,
    /// Chunking counters.
    pub chunking: ChunkStats,
    /// Embedding counters, including dropped batches.
    pub embedding: EmbedOutcome,
    /// Vector width of the collection, absent when nothing was embedded.
    pub dimension: Option<usize>,
    /// Upsert counters.
    pub upsert: UpsertReport,
}

impl IngestReport {
    /// Report for a run that stopped before creating a collection.
    pub fn empty(
        collection: &CollectionName,
        knowledge_bank_records: usize,
        field_issue_records: usize,
        chunking: ChunkStats,
        embedding: EmbedOutcome,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            knowledge_bank_records,
            field_issue_records,
            chunking,
            embedding,
            dimension: None,
            upsert: UpsertReport::default(),
        }
    }

    /// Points that made it into the collection.
    pub fn points_written(&self) -> usize {
        self.upsert.points_written
    }

    /// Collection name, only when the run actually created it.
    pub fn indexed_collection(&self) -> Option<&str> {
        self.dimension.map(|_| self.collection.as_str())
    }
}

/// Summary of one generation run over an existing collection.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateReport {
    /// Collection searched.
    pub collection: String,
    /// Query text.
    pub query: String,
    /// Requested hit count.
    pub top_k: usize,
    /// Hit and batch counters.
    pub retrieval: RetrievalRun,
    /// Entries produced across successful batches.
    pub entries: usize,
}

impl GenerateReport {
    /// Builds the report from a finished retrieval run.
    pub fn new(collection: &CollectionName, query: &str, top_k: usize, run: &RetrievalRun) -> Self {
        Self {
            collection: collection.to_string(),
            query: query.to_string(),
            top_k,
            retrieval: run.clone(),
            entries: run.entries.len(),
        }
    }

    /// Whether any generation batch was lost.
    pub fn is_partial(&self) -> bool {
        !self.retrieval.failed_batches.is_empty()
    }
}
