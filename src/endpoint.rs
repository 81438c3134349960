//! Connection settings and response classification shared by the
//! OpenAI-compatible embedding and chat clients.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use url::Url;

use crate::error::{ConfigError, ProviderError};

const MAX_ERROR_BODY: usize = 512;

/// Wire dialect spoken by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `Authorization: Bearer`, model named in the request body.
    OpenAi,
    /// `api-key` header, model named by the deployment path segment.
    Azure {
        /// Value for the `api-version` query parameter.
        api_version: String,
    },
}

/// Base URL, credential and model/deployment for one provider.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    base_url: String,
    api_key: String,
    model: String,
    flavor: ApiFlavor,
}

impl ProviderEndpoint {
    /// Validates and stores the endpoint settings.
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        flavor: ApiFlavor,
    ) -> Result<Self, ConfigError> {
        if base_url.trim().is_empty() {
            return Err(ConfigError::Missing("endpoint"));
        }
        if api_key.trim().is_empty() {
            return Err(ConfigError::Missing("api key"));
        }
        if model.trim().is_empty() {
            return Err(ConfigError::Missing("model or deployment"));
        }
        let parsed = Url::parse(base_url.trim()).map_err(|err| ConfigError::Invalid {
            name: "endpoint",
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: "endpoint",
                reason: format!("unsupported scheme `{}`", parsed.scheme()),
            });
        }
        if let ApiFlavor::Azure { api_version } = &flavor {
            if api_version.trim().is_empty() {
                return Err(ConfigError::Missing("api version"));
            }
        }
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            model: model.trim().to_string(),
            flavor,
        })
    }

    /// Model name or Azure deployment.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Wire dialect.
    pub fn flavor(&self) -> &ApiFlavor {
        &self.flavor
    }

    /// Full URL for an operation such as `embeddings` or `chat/completions`.
    pub fn url_for(&self, operation: &str) -> String {
        match &self.flavor {
            ApiFlavor::OpenAi => format!("{}/{}", self.base_url, operation),
            ApiFlavor::Azure { api_version } => format!(
                "{}/openai/deployments/{}/{}?api-version={}",
                self.base_url, self.model, operation, api_version
            ),
        }
    }

    /// Builds an HTTP client carrying the auth headers for this endpoint.
    pub fn client(&self, timeout: Duration) -> Result<Client, ConfigError> {
        let mut headers = HeaderMap::new();
        let invalid_key = |_| ConfigError::Invalid {
            name: "api key",
            reason: "contains characters not allowed in a header".into(),
        };
        match self.flavor {
            ApiFlavor::OpenAi => {
                let auth = format!("Bearer {}", self.api_key);
                headers.insert(AUTHORIZATION, HeaderValue::from_str(&auth).map_err(invalid_key)?);
            }
            ApiFlavor::Azure { .. } => {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(&self.api_key).map_err(invalid_key)?,
                );
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| ConfigError::Invalid {
                name: "http client",
                reason: err.to_string(),
            })
    }
}

/// Maps a non-success status to the provider error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> ProviderError {
    let body = truncate(body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited(body)
    } else if status.is_server_error() {
        ProviderError::Server {
            status: status.as_u16(),
            body,
        }
    } else {
        ProviderError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

/// Maps a transport failure; decode errors count as malformed responses.
pub fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Malformed(err.to_string())
    } else {
        ProviderError::Connection(err.to_string())
    }
}

/// Returns the response when successful, otherwise a classified error.
pub async fn check_status(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(classify_status(status, body))
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}
