//! Embedded chunk records and token usage accounting.

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkMetadata;
use crate::records::Source;

/// Chunk paired with its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    /// Chunk body submitted to the embedding model.
    pub text: String,
    /// Model embedding vector.
    pub embedding: Vec<f32>,
    /// Lineage copied from the source chunk.
    pub metadata: ChunkMetadata,
    /// Tokens in `text` under the chunking tokenizer.
    pub token_count: usize,
}

/// Totals over a set of embedded chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Chunks embedded.
    pub chunks: usize,
    /// Tokens across all chunks.
    pub total_tokens: usize,
    /// Tokens from knowledge bank chunks.
    pub knowledge_bank_tokens: usize,
    /// Tokens from field issue chunks.
    pub field_issues_tokens: usize,
}

impl UsageSummary {
    /// Aggregates token counts per source.
    pub fn from_chunks(chunks: &[EmbeddedChunk]) -> Self {
        chunks.iter().fold(Self::default(), |mut acc, chunk| {
            acc.chunks += 1;
            acc.total_tokens += chunk.token_count;
            match chunk.metadata.source {
                Source::KnowledgeBank => acc.knowledge_bank_tokens += chunk.token_count,
                Source::FieldIssues => acc.field_issues_tokens += chunk.token_count,
            }
            acc
        })
    }

    /// Emits the summary at `info`.
    pub fn log(&self) {
        tracing::info!(
            chunks = self.chunks,
            total_tokens = self.total_tokens,
            knowledge_bank_tokens = self.knowledge_bank_tokens,
            field_issues_tokens = self.field_issues_tokens,
            "embedding token usage"
        );
    }
}

/// Vector width shared by `chunks`, or `None` when empty or inconsistent.
pub fn common_dimension(chunks: &[EmbeddedChunk]) -> Option<usize> {
    let first = chunks.first()?.embedding.len();
    chunks
        .iter()
        .all(|chunk| chunk.embedding.len() == first)
        .then_some(first)
}
