//! Qdrant REST client scoped to one collection.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;

use super::{CollectionName, Distance, SearchResult, VectorIndex, VectorPoint};
use crate::error::{ConfigError, StoreError};

/// Connection settings for a Qdrant deployment.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl QdrantConfig {
    /// `url` must be an http(s) URL; a blank `api_key` is treated as absent.
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ConfigError> {
        if url.trim().is_empty() {
            return Err(ConfigError::Missing("qdrant endpoint"));
        }
        let parsed = Url::parse(url.trim()).map_err(|err| ConfigError::Invalid {
            name: "qdrant endpoint",
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: "qdrant endpoint",
                reason: format!("unsupported scheme `{}`", parsed.scheme()),
            });
        }
        Ok(Self {
            url: url.trim().trim_end_matches('/').to_string(),
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            timeout,
        })
    }

    /// Base URL without a trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Qdrant-backed [`VectorIndex`].
#[derive(Clone)]
pub struct QdrantIndex {
    client: Client,
    collection_url: String,
    name: CollectionName,
}

impl QdrantIndex {
    /// Builds a client bound to `name`.
    pub fn new(config: &QdrantConfig, name: CollectionName) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key).map_err(|_| ConfigError::Invalid {
                    name: "qdrant api key",
                    reason: "contains characters not allowed in a header".into(),
                })?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| ConfigError::Invalid {
                name: "qdrant client",
                reason: err.to_string(),
            })?;
        Ok(Self {
            client,
            collection_url: format!("{}/collections/{}", config.url, name),
            name,
        })
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let resp = request
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::MissingCollection(self.name.to_string()));
        }
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(StoreError::Request {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn collection(&self) -> &CollectionName {
        &self.name
    }

    async fn create_collection(&self, dim: usize, distance: Distance) -> Result<(), StoreError> {
        match self.send(self.client.delete(&self.collection_url)).await {
            Ok(_) | Err(StoreError::MissingCollection(_)) => {}
            Err(err) => return Err(err),
        }
        let body = json!({ "vectors": { "size": dim, "distance": distance } });
        self.send(self.client.put(&self.collection_url).json(&body))
            .await?;
        tracing::info!(collection = %self.name, dim, "created session collection");
        Ok(())
    }

    async fn upsert_batch(&self, points: &[VectorPoint]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let url = format!("{}/points", self.collection_url);
        let body = UpsertRequest { points };
        self.send(self.client.put(url).query(&[("wait", "true")]).json(&body))
            .await?;
        Ok(())
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<SearchResult>, StoreError> {
        let url = format!("{}/points/search", self.collection_url);
        let body = SearchRequest {
            vector,
            limit: top_k,
            with_payload: true,
        };
        let resp = self.send(self.client.post(url).json(&body)).await?;
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        Ok(parsed.into_results())
    }

    async fn delete_collection(&self) -> Result<(), StoreError> {
        self.send(self.client.delete(&self.collection_url)).await?;
        tracing::info!(collection = %self.name, "collection deleted");
        Ok(())
    }
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: &'a [VectorPoint],
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchHit>,
}

impl SearchResponse {
    fn into_results(self) -> Vec<SearchResult> {
        let mut hits: Vec<SearchResult> = self
            .result
            .into_iter()
            .map(|hit| SearchResult::from_payload(hit.score, hit.payload.unwrap_or_default()))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits
    }
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}
