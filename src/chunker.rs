//! Record normalization and token-bounded slicing.
//!
//! Rows are flattened into `key: value | key: value` text, tagged with their
//! source and a fresh id, and then cut into overlapping token windows so no
//! emitted chunk exceeds the configured token budget.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiktoken_rs::CoreBPE;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::records::{Record, Source};

const FIELD_SEPARATOR: &str = " | ";

/// Lineage attached to every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Id of the originating record, shared by all of its slices.
    pub id: Uuid,
    /// Input the record came from.
    pub source: Source,
}

/// Text unit ready for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Chunk body.
    pub text: String,
    /// Lineage metadata.
    pub metadata: ChunkMetadata,
}

/// Token encoder used for counting and slicing.
pub trait Tokenizer: Send + Sync {
    /// Encodes text into token ids.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decodes a token slice back into text. Bytes that do not form valid
    /// UTF-8 at the slice edges become U+FFFD.
    fn decode(&self, tokens: &[u32]) -> String;

    /// Number of tokens in `text`.
    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// `cl100k_base`, the encoding behind `text-embedding-ada-002`.
pub struct Cl100kTokenizer {
    bpe: CoreBPE,
}

impl Cl100kTokenizer {
    /// Loads the BPE ranks.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl Tokenizer for Cl100kTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|token| token as u32)
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        // Byte-level tokens can split a character at the window edge.
        let bytes: Vec<u8> = self
            .bpe
            ._decode_native_and_split(tokens.to_vec())
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Slicing budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    max_tokens: usize,
    overlap: usize,
}

impl ChunkConfig {
    /// Validates that windows advance: `0 < max_tokens` and `overlap < max_tokens`.
    pub fn new(max_tokens: usize, overlap: usize) -> Result<Self, ConfigError> {
        if max_tokens == 0 {
            return Err(ConfigError::Zero("max_tokens"));
        }
        if overlap >= max_tokens {
            return Err(ConfigError::OverlapTooLarge {
                max_tokens,
                overlap,
            });
        }
        Ok(Self {
            max_tokens,
            overlap,
        })
    }

    /// Window width in tokens.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Tokens shared by consecutive windows.
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Distance between window starts.
    pub fn step(&self) -> usize {
        self.max_tokens - self.overlap
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1500,
            overlap: 100,
        }
    }
}

/// Flattens a record into `key: value` pairs joined by ` | `.
///
/// Nulls and values that are blank after trimming are skipped.
pub fn format_record(record: &Record) -> String {
    record
        .iter()
        .filter_map(|(key, value)| {
            let rendered = render_value(value)?;
            let rendered = rendered.trim();
            if rendered.is_empty() {
                return None;
            }
            Some(format!("{}: {}", key.trim(), rendered))
        })
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR)
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Turns records into chunks tagged with `source`; rows with no text are dropped.
pub fn chunk_records(records: &[Record], source: Source) -> Vec<TextChunk> {
    records
        .iter()
        .filter_map(|record| {
            let text = format_record(record);
            if text.trim().is_empty() {
                return None;
            }
            Some(TextChunk {
                text,
                metadata: ChunkMetadata {
                    id: Uuid::new_v4(),
                    source,
                },
            })
        })
        .collect()
}

/// Window offsets covering `len` tokens.
///
/// Returns a single `0..len` window when `len <= max_tokens`. Otherwise the
/// windows have width `max_tokens`, advance by `max_tokens - overlap`, and
/// stop at the first window whose end reaches `len`.
pub fn token_windows(len: usize, config: &ChunkConfig) -> Vec<Range<usize>> {
    if len <= config.max_tokens {
        return vec![0..len];
    }
    let mut windows = Vec::with_capacity((len - config.max_tokens).div_ceil(config.step()) + 1);
    let mut start = 0usize;
    loop {
        let end = (start + config.max_tokens).min(len);
        windows.push(start..end);
        if end == len {
            break;
        }
        start += config.step();
    }
    windows
}

/// Summary counters from a chunking run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    /// Chunks before slicing.
    pub records_chunked: usize,
    /// Chunks after slicing.
    pub slices: usize,
    /// Tokens across all unsliced chunks.
    pub total_tokens: usize,
}

/// Normalizes and slices records under a token budget.
pub struct ChunkEngine<T = Cl100kTokenizer> {
    tokenizer: T,
    config: ChunkConfig,
}

impl<T: Tokenizer> ChunkEngine<T> {
    /// Builds an engine around a tokenizer.
    pub fn new(tokenizer: T, config: ChunkConfig) -> Self {
        Self { tokenizer, config }
    }

    /// Active slicing budget.
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Tokenizer used for slicing and counting.
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Same as [`chunk_records`].
    pub fn chunk(&self, records: &[Record], source: Source) -> Vec<TextChunk> {
        chunk_records(records, source)
    }

    /// Splits oversized chunks into overlapping windows.
    pub fn slice(&self, chunks: Vec<TextChunk>) -> Vec<TextChunk> {
        self.slice_counted(chunks).0
    }

    /// Chunks both sources, knowledge bank first, and slices the merged set.
    pub fn run(
        &self,
        knowledge_bank: &[Record],
        field_issues: &[Record],
    ) -> (Vec<TextChunk>, ChunkStats) {
        let mut chunks = self.chunk(knowledge_bank, Source::KnowledgeBank);
        let kb_count = chunks.len();
        chunks.extend(self.chunk(field_issues, Source::FieldIssues));
        let records_chunked = chunks.len();
        tracing::info!(
            knowledge_bank = kb_count,
            field_issues = records_chunked - kb_count,
            "merged {records_chunked} chunks before token slicing"
        );

        let (slices, total_tokens) = self.slice_counted(chunks);
        let stats = ChunkStats {
            records_chunked,
            slices: slices.len(),
            total_tokens,
        };
        tracing::info!(
            slices = stats.slices,
            total_tokens = stats.total_tokens,
            "token slicing complete"
        );
        (slices, stats)
    }

    fn slice_counted(&self, chunks: Vec<TextChunk>) -> (Vec<TextChunk>, usize) {
        let mut sliced = Vec::with_capacity(chunks.len());
        let mut total_tokens = 0usize;
        for chunk in chunks {
            let tokens = self.tokenizer.encode(&chunk.text);
            total_tokens += tokens.len();
            if tokens.len() <= self.config.max_tokens {
                sliced.push(chunk);
                continue;
            }
            for window in token_windows(tokens.len(), &self.config) {
                sliced.push(TextChunk {
                    text: self.tokenizer.decode(&tokens[window]),
                    metadata: chunk.metadata.clone(),
                });
            }
        }
        (sliced, total_tokens)
    }
}
