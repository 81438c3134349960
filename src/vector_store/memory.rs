//! In-process collection with brute-force scoring.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CollectionName, Distance, SearchResult, VectorIndex, VectorPoint};
use crate::error::StoreError;

struct Collection {
    dim: usize,
    distance: Distance,
    points: BTreeMap<u64, VectorPoint>,
}

/// Vector index held in memory, for tests and offline runs.
pub struct MemoryIndex {
    name: CollectionName,
    state: RwLock<Option<Collection>>,
}

impl MemoryIndex {
    /// Handle for a collection that does not exist yet.
    pub fn new(name: CollectionName) -> Self {
        Self {
            name,
            state: RwLock::new(None),
        }
    }

    /// Stored points, or `None` when the collection does not exist.
    pub async fn len(&self) -> Option<usize> {
        self.state.read().await.as_ref().map(|c| c.points.len())
    }

    /// Whether the collection currently exists.
    pub async fn exists(&self) -> bool {
        self.state.read().await.is_some()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn collection(&self) -> &CollectionName {
        &self.name
    }

    async fn create_collection(&self, dim: usize, distance: Distance) -> Result<(), StoreError> {
        *self.state.write().await = Some(Collection {
            dim,
            distance,
            points: BTreeMap::new(),
        });
        tracing::info!(collection = %self.name, dim, "created in-memory collection");
        Ok(())
    }

    async fn upsert_batch(&self, points: &[VectorPoint]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let collection = state
            .as_mut()
            .ok_or_else(|| StoreError::MissingCollection(self.name.to_string()))?;
        if let Some(bad) = points.iter().find(|p| p.vector.len() != collection.dim) {
            return Err(StoreError::Dimension {
                expected: collection.dim,
                actual: bad.vector.len(),
            });
        }
        for point in points {
            collection.points.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<SearchResult>, StoreError> {
        let state = self.state.read().await;
        let collection = state
            .as_ref()
            .ok_or_else(|| StoreError::MissingCollection(self.name.to_string()))?;
        if vector.len() != collection.dim {
            return Err(StoreError::Dimension {
                expected: collection.dim,
                actual: vector.len(),
            });
        }
        let mut scored: Vec<(f32, &VectorPoint)> = collection
            .points
            .values()
            .map(|point| (score(collection.distance, vector, &point.vector), point))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.id.cmp(&b.1.id)));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, point)| SearchResult::from_payload(score, point.payload.clone()))
            .collect())
    }

    async fn delete_collection(&self) -> Result<(), StoreError> {
        match self.state.write().await.take() {
            Some(_) => Ok(()),
            None => Err(StoreError::MissingCollection(self.name.to_string())),
        }
    }
}

fn score(distance: Distance, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match distance {
        Distance::Dot => dot,
        Distance::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
    }
}
