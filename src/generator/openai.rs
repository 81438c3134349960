//! Chat-completions client for OpenAI-compatible and Azure OpenAI endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{GenerationProvider, GenerationRequest};
use crate::endpoint::{check_status, classify_transport, ProviderEndpoint};
use crate::error::{ConfigError, ProviderError};

/// Chat-completions provider.
#[derive(Clone)]
pub struct OpenAiChat {
    client: Client,
    url: String,
    model: String,
}

impl OpenAiChat {
    /// Builds a chat client for `endpoint`.
    pub fn new(endpoint: &ProviderEndpoint, timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            client: endpoint.client(timeout)?,
            url: endpoint.url_for("chat/completions"),
            model: endpoint.model().to_string(),
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiChat {
    async fn complete(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.user,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let resp = check_status(resp).await?;
        let parsed: ChatResponse = resp.json().await.map_err(classify_transport)?;
        parsed.into_text()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl ChatResponse {
    fn into_text(self) -> Result<String, ProviderError> {
        self.choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("response has no message content".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
