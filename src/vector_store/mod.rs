//! Named vector collections: lifecycle, batched upsert and similarity search.

pub mod memory;
pub mod qdrant;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::embeddings::EmbeddedChunk;
use crate::error::{ConfigError, StoreError};

pub use memory::MemoryIndex;
pub use qdrant::{QdrantConfig, QdrantIndex};

/// Points written per upsert request unless overridden.
pub const DEFAULT_UPSERT_BATCH: usize = 500;

/// Short random namespace for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Eight hex characters from a fresh v4 UUID.
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    /// Uses a caller-provided id.
    pub fn new(id: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.into();
        validate_name("session id", &id)?;
        Ok(Self(id))
    }

    /// Raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionName(String);

impl CollectionName {
    /// Uses `name` verbatim (a shared collection).
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        validate_name("collection", &name)?;
        Ok(Self(name))
    }

    /// `{base}_{session}`, isolating one run's points.
    pub fn session(base: &str, session: &SessionId) -> Result<Self, ConfigError> {
        Self::new(format!("{}_{}", base.trim(), session))
    }

    /// Raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_name(kind: &'static str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Missing(kind));
    }
    if let Some(bad) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')))
    {
        return Err(ConfigError::Invalid {
            name: kind,
            reason: format!("character {bad:?} is not allowed in `{name}`"),
        });
    }
    Ok(())
}

/// Similarity metric of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    /// Cosine similarity.
    #[default]
    Cosine,
    /// Raw dot product.
    Dot,
}

/// Point written to a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    /// Sequential id within one upsert call.
    pub id: u64,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Chunk metadata plus its `text`.
    pub payload: Map<String, Value>,
}

/// Search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Similarity score, higher is closer.
    pub score: f32,
    /// Stored chunk text.
    pub text: String,
    /// Full stored payload.
    pub metadata: Map<String, Value>,
}

impl SearchResult {
    /// Splits `text` out of a stored payload.
    pub fn from_payload(score: f32, payload: Map<String, Value>) -> Self {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            score,
            text,
            metadata: payload,
        }
    }
}

/// Outcome of a batched upsert; failed batches are skipped, not retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    /// Batches attempted.
    pub batches: usize,
    /// Batches the backend rejected.
    pub failed_batches: usize,
    /// Points in accepted batches.
    pub points_written: usize,
    /// Points in rejected batches.
    pub points_skipped: usize,
}

/// One named collection in a vector store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Collection this handle operates on.
    fn collection(&self) -> &CollectionName;

    /// Drops any existing collection of this name and creates an empty one.
    async fn create_collection(&self, dim: usize, distance: Distance) -> Result<(), StoreError>;

    /// Writes one batch of points.
    async fn upsert_batch(&self, points: &[VectorPoint]) -> Result<(), StoreError>;

    /// Up to `top_k` hits ordered by descending score.
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<SearchResult>, StoreError>;

    /// Removes the collection.
    async fn delete_collection(&self) -> Result<(), StoreError>;

    /// Writes `points` in batches of at most `batch_limit`. A failed batch is
    /// logged and skipped while the remaining batches are still written.
    async fn upsert(&self, points: &[VectorPoint], batch_limit: usize) -> UpsertReport {
        let batch_limit = batch_limit.max(1);
        let mut report = UpsertReport {
            batches: points.len().div_ceil(batch_limit),
            ..UpsertReport::default()
        };
        tracing::info!(
            collection = %self.collection(),
            "uploading {} vectors in {} batch(es)",
            points.len(),
            report.batches
        );
        for (idx, batch) in points.chunks(batch_limit).enumerate() {
            match self.upsert_batch(batch).await {
                Ok(()) => report.points_written += batch.len(),
                Err(err) => {
                    tracing::warn!(
                        collection = %self.collection(),
                        "upsert batch {}/{} failed: {err}",
                        idx + 1,
                        report.batches
                    );
                    report.failed_batches += 1;
                    report.points_skipped += batch.len();
                }
            }
        }
        report
    }
}

/// Builds points with sequential ids and `{id, source, text}` payloads.
pub fn points_from_embedded(chunks: &[EmbeddedChunk]) -> Vec<VectorPoint> {
    chunks
        .iter()
        .enumerate()
        .map(|(idx, chunk)| {
            let mut payload = Map::new();
            payload.insert("id".into(), Value::String(chunk.metadata.id.to_string()));
            payload.insert(
                "source".into(),
                Value::String(chunk.metadata.source.as_str().to_string()),
            );
            payload.insert("text".into(), Value::String(chunk.text.clone()));
            VectorPoint {
                id: idx as u64,
                vector: chunk.embedding.clone(),
                payload,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkMetadata;
    use crate::records::Source;

    #[test]
    fn session_names_are_isolated() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_eq!(a.as_str().len(), 8);
        assert_ne!(a, b);
        let name = CollectionName::session("dfmea_collection", &a).unwrap();
        assert_eq!(name.as_str(), format!("dfmea_collection_{a}"));
    }

    #[test]
    fn rejects_unsafe_collection_names() {
        assert!(CollectionName::new("ok-name_1.v2").is_ok());
        assert_eq!(CollectionName::new("  "), Err(ConfigError::Missing("collection")));
        assert!(matches!(
            CollectionName::new("a/b"),
            Err(ConfigError::Invalid { name: "collection", .. })
        ));
    }

    #[test]
    fn points_carry_metadata_and_text() {
        let id = Uuid::new_v4();
        let chunks = vec![
            EmbeddedChunk {
                text: "first".into(),
                embedding: vec![1.0, 0.0],
                metadata: ChunkMetadata {
                    id,
                    source: Source::KnowledgeBank,
                },
                token_count: 1,
            },
            EmbeddedChunk {
                text: "second".into(),
                embedding: vec![0.0, 1.0],
                metadata: ChunkMetadata {
                    id,
                    source: Source::KnowledgeBank,
                },
                token_count: 1,
            },
        ];
        let points = points_from_embedded(&chunks);
        assert_eq!(points.iter().map(|p| p.id).collect::<Vec<_>>(), [0, 1]);
        assert_eq!(points[1].payload["text"], "second");
        assert_eq!(points[1].payload["source"], "knowledge_bank");
        assert_eq!(points[0].payload["id"], id.to_string());

        let hit = SearchResult::from_payload(0.9, points[1].payload.clone());
        assert_eq!(hit.text, "second");
    }
}
