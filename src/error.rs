//! Error taxonomy shared by the pipeline stages.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid or missing settings detected before any processing starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Slice overlap would make the window step zero or negative.
    #[error("chunk overlap ({overlap}) must be smaller than max tokens ({max_tokens})")]
    OverlapTooLarge {
        /// Configured window width.
        max_tokens: usize,
        /// Configured overlap.
        overlap: usize,
    },
    /// A size or count that must be positive was zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    /// A required endpoint, credential or name was absent or blank.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    /// A setting was present but unusable.
    #[error("invalid setting `{name}`: {reason}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// Human readable reason.
        reason: String,
    },
}

/// Failure talking to an embedding or generation provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// HTTP 429 from the provider.
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    /// Transport-level failure (connect, timeout, dropped body).
    #[error("connection to provider failed: {0}")]
    Connection(String),
    /// Transient 5xx response.
    #[error("provider server error ({status}): {body}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// Non-retryable rejection (auth, bad request, unknown deployment).
    #[error("provider rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The response arrived but could not be used.
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Rate limits, connection drops and 5xx responses.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Connection(_) | Self::Server { .. }
        )
    }

    /// True for unusable response bodies.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Failure reported by a vector index backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend answered with a non-success status.
    #[error("vector store request failed ({status}): {body}")]
    Request {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// The backend could not be reached.
    #[error("vector store unreachable: {0}")]
    Transport(String),
    /// The collection does not exist.
    #[error("collection `{0}` does not exist")]
    MissingCollection(String),
    /// A point's vector width differs from the collection's.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    Dimension {
        /// Collection width.
        expected: usize,
        /// Offending vector width.
        actual: usize,
    },
    /// The backend response could not be decoded.
    #[error("unexpected vector store response: {0}")]
    Decode(String),
}

/// Failure loading tabular source rows.
#[derive(Debug, Error)]
pub enum RecordsError {
    /// The input path does not resolve to a file.
    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// The file exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// A row could not be decoded into a record.
    #[error("invalid record in {} at line {line}: {reason}", path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// One-based line number (1 for whole-file JSON arrays).
        line: usize,
        /// Decoder message.
        reason: String,
    },
}

/// Failure of a whole retrieval call (per-batch failures never surface here).
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The query could not be embedded.
    #[error("failed to embed query: {0}")]
    QueryEmbedding(#[source] ProviderError),
    /// The index search failed.
    #[error("vector search failed: {0}")]
    Search(#[source] StoreError),
}
