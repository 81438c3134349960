//! OpenAI-compatible embeddings client (OpenAI and Azure OpenAI).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::EmbeddingProvider;
use crate::endpoint::{check_status, classify_transport, ProviderEndpoint};
use crate::error::{ConfigError, ProviderError};

/// Async embeddings client that talks to OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    url: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    /// Builds a new embeddings client.
    pub fn new(
        endpoint: &ProviderEndpoint,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client: endpoint.client(timeout)?,
            url: endpoint.url_for("embeddings"),
            model: endpoint.model().to_string(),
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;
        let resp = check_status(resp).await?;
        let parsed: EmbeddingResponse = resp.json().await.map_err(classify_transport)?;
        if let Some(usage) = &parsed.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                total_tokens = usage.total_tokens,
                "embedding request usage"
            );
        }
        parsed.into_vectors(inputs.len())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

impl EmbeddingResponse {
    fn into_vectors(mut self, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
        if self.data.len() != expected {
            return Err(ProviderError::Malformed(format!(
                "provider returned {} embeddings for {} inputs",
                self.data.len(),
                expected
            )));
        }
        self.data.sort_by_key(|entry| entry.index);
        Ok(self.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_vectors_follow_input_order() {
        let body = r#"{
            "data": [
                {"embedding": [0.2, 0.2], "index": 1},
                {"embedding": [0.1, 0.1], "index": 0}
            ],
            "usage": {"prompt_tokens": 6, "total_tokens": 6}
        }"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.into_vectors(2).unwrap(),
            vec![vec![0.1, 0.1], vec![0.2, 0.2]]
        );
    }

    #[test]
    fn short_responses_are_malformed() {
        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [1.0], "index": 0}]}"#).unwrap();
        assert!(parsed.into_vectors(2).unwrap_err().is_malformed());
    }

    #[test]
    fn request_omits_unset_dimensions() {
        let inputs = ["a", "b"];
        let request = EmbeddingRequest {
            model: "text-embedding-ada-002",
            input: &inputs,
            dimensions: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"model": "text-embedding-ada-002", "input": ["a", "b"]})
        );
    }
}
