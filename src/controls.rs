//! Command-line and environment configuration shared by the binaries.
//!
//! Each group flattens into a binary's parser and builds one validated
//! config; validation errors surface before any record is read.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::chunker::ChunkConfig;
use crate::embedder::openai::OpenAiEmbedder;
use crate::embedder::BatchConfig;
use crate::endpoint::{ApiFlavor, ProviderEndpoint};
use crate::error::ConfigError;
use crate::generator::openai::OpenAiChat;
use crate::records::SourceFiles;
use crate::retrieval::RetrievalConfig;
use crate::vector_store::{CollectionName, QdrantConfig, SessionId};

/// Query used when none is given.
pub const DEFAULT_QUERY: &str = "Generate DFMEA entries for recent field failures";

/// Which wire dialect the model endpoints speak.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum FlavorArg {
    /// Azure OpenAI deployments.
    Azure,
    /// OpenAI-compatible `/v1` endpoints.
    Openai,
}

/// Input files for the two record sources.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Knowledge bank rows (.json array or JSONL)
    #[arg(long, env = "DFMEA_KNOWLEDGE_BANK")]
    pub knowledge_bank: PathBuf,

    /// Field issue rows (.json array or JSONL)
    #[arg(long, env = "DFMEA_FIELD_ISSUES")]
    pub field_issues: PathBuf,
}

impl SourceArgs {
    /// Checks both files exist.
    pub fn build_sources(&self) -> Result<SourceFiles, crate::error::RecordsError> {
        SourceFiles::new(&self.knowledge_bank, &self.field_issues)
    }
}

/// Token slicing budget.
#[derive(Args, Debug, Clone)]
pub struct ChunkArgs {
    /// Maximum tokens per chunk
    #[arg(long, env = "DFMEA_MAX_TOKENS", default_value_t = 1500)]
    pub max_tokens: usize,

    /// Tokens shared by consecutive slices
    #[arg(long, env = "DFMEA_OVERLAP", default_value_t = 100)]
    pub overlap: usize,
}

impl ChunkArgs {
    /// Rejects an overlap that would stall the window.
    pub fn build_chunk_config(&self) -> Result<ChunkConfig, ConfigError> {
        ChunkConfig::new(self.max_tokens, self.overlap)
    }
}

/// Embedding endpoint and batching.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// Endpoint dialect
    #[arg(long, env = "DFMEA_API_FLAVOR", value_enum, default_value_t = FlavorArg::Azure)]
    pub flavor: FlavorArg,

    /// Base URL of the embedding endpoint
    #[arg(long, env = "AZURE_OPENAI_ENDPOINT", default_value = "")]
    pub embedding_endpoint: String,

    /// API key for the embedding endpoint
    #[arg(
        long,
        env = "AZURE_OPENAI_API_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub embedding_api_key: String,

    /// Embedding model or Azure deployment name
    #[arg(
        long,
        env = "AZURE_OPENAI_EMBEDDING_DEPLOYMENT",
        default_value = "text-embedding-3-small"
    )]
    pub embedding_deployment: String,

    /// Azure api-version for embedding calls
    #[arg(
        long,
        env = "AZURE_OPENAI_EMBEDDING_API_VERSION",
        default_value = "2024-02-01"
    )]
    pub embedding_api_version: String,

    /// Requested vector size (models that support truncation only)
    #[arg(long, env = "DFMEA_EMBEDDING_DIMENSIONS")]
    pub dimensions: Option<usize>,

    /// Chunks per embedding request
    #[arg(long, env = "DFMEA_EMBEDDING_BATCH", default_value_t = 50)]
    pub embedding_batch: usize,

    /// Milliseconds to pause after every embedding batch
    #[arg(long, env = "DFMEA_EMBEDDING_COOLDOWN_MS", default_value_t = 2000)]
    pub cooldown_ms: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub embedding_timeout_secs: u64,
}

impl EmbeddingArgs {
    /// Validated endpoint settings.
    pub fn build_endpoint(&self) -> Result<ProviderEndpoint, ConfigError> {
        ProviderEndpoint::new(
            &self.embedding_endpoint,
            &self.embedding_api_key,
            &self.embedding_deployment,
            flavor(self.flavor, &self.embedding_api_version),
        )
    }

    /// Batch size and cooldown.
    pub fn build_batch_config(&self) -> Result<BatchConfig, ConfigError> {
        BatchConfig::new(
            self.embedding_batch,
            Duration::from_millis(self.cooldown_ms),
        )
    }

    /// HTTP client for the embedding endpoint.
    pub fn build_provider(&self) -> Result<OpenAiEmbedder, ConfigError> {
        OpenAiEmbedder::new(
            &self.build_endpoint()?,
            self.dimensions,
            Duration::from_secs(self.embedding_timeout_secs),
        )
    }
}

/// Chat endpoint used for generation.
#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Base URL of the chat endpoint
    #[arg(long, env = "AZURE_OPENAI_ENDPOINT", default_value = "")]
    pub chat_endpoint: String,

    /// API key for the chat endpoint
    #[arg(
        long,
        env = "AZURE_OPENAI_API_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub chat_api_key: String,

    /// Chat model or Azure deployment name
    #[arg(
        long,
        env = "AZURE_OPENAI_CHAT_DEPLOYMENT",
        default_value = "gpt-4o"
    )]
    pub chat_deployment: String,

    /// Azure api-version for chat calls
    #[arg(
        long,
        env = "AZURE_OPENAI_CHAT_API_VERSION",
        default_value = "2024-02-01"
    )]
    pub chat_api_version: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 120)]
    pub chat_timeout_secs: u64,
}

impl ChatArgs {
    /// HTTP client for the chat endpoint, using the embedding group's dialect.
    pub fn build_provider(&self, flavor_arg: FlavorArg) -> Result<OpenAiChat, ConfigError> {
        let endpoint = ProviderEndpoint::new(
            &self.chat_endpoint,
            &self.chat_api_key,
            &self.chat_deployment,
            flavor(flavor_arg, &self.chat_api_version),
        )?;
        OpenAiChat::new(&endpoint, Duration::from_secs(self.chat_timeout_secs))
    }
}

/// Qdrant connection and collection naming.
#[derive(Args, Debug, Clone)]
pub struct QdrantArgs {
    /// Qdrant REST endpoint
    #[arg(long, env = "QDRANT_ENDPOINT", default_value = "http://localhost:6333")]
    pub qdrant_url: String,

    /// Qdrant API key
    #[arg(long, env = "QDRANT_API_KEY", hide_env_values = true)]
    pub qdrant_api_key: Option<String>,

    /// Base collection name; a session suffix is appended per ingest run
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "dfmea_collection")]
    pub collection_base: String,

    /// Points per upsert request
    #[arg(long, env = "DFMEA_UPSERT_BATCH", default_value_t = 500)]
    pub upsert_batch: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub qdrant_timeout_secs: u64,
}

impl QdrantArgs {
    /// Validated connection settings.
    pub fn build_qdrant_config(&self) -> Result<QdrantConfig, ConfigError> {
        QdrantConfig::new(
            &self.qdrant_url,
            self.qdrant_api_key.clone(),
            Duration::from_secs(self.qdrant_timeout_secs),
        )
    }

    /// `{base}_{session}` for a fresh ingest run.
    pub fn session_collection(&self, session: &SessionId) -> Result<CollectionName, ConfigError> {
        CollectionName::session(&self.collection_base, session)
    }

    /// Upsert batch limit.
    pub fn upsert_limit(&self) -> Result<usize, ConfigError> {
        if self.upsert_batch == 0 {
            return Err(ConfigError::Zero("upsert batch size"));
        }
        Ok(self.upsert_batch)
    }
}

/// Query and generation fan-out.
#[derive(Args, Debug, Clone)]
pub struct RetrievalArgs {
    /// Retrieval query
    #[arg(long, env = "DFMEA_QUERY", default_value = DEFAULT_QUERY)]
    pub query: String,

    /// Hits to retrieve
    #[arg(long, env = "DFMEA_TOP_K", default_value_t = 100)]
    pub top_k: usize,

    /// Hit texts per generation request
    #[arg(long, env = "DFMEA_GENERATION_BATCH", default_value_t = 5)]
    pub generation_batch: usize,

    /// Sampling temperature
    #[arg(long, env = "DFMEA_TEMPERATURE", default_value_t = 0.3)]
    pub temperature: f32,

    /// File whose contents replace the built-in instruction
    #[arg(long, env = "DFMEA_SYSTEM_PROMPT_FILE")]
    pub system_prompt_file: Option<PathBuf>,
}

impl RetrievalArgs {
    /// Fan-out config, reading the prompt override if one is named.
    pub fn build_retrieval_config(&self) -> Result<RetrievalConfig, ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::Zero("top_k"));
        }
        let config = RetrievalConfig::new(self.generation_batch, self.temperature)?;
        let Some(path) = &self.system_prompt_file else {
            return Ok(config);
        };
        let prompt = std::fs::read_to_string(path).map_err(|err| ConfigError::Invalid {
            name: "system prompt file",
            reason: format!("{}: {err}", path.display()),
        })?;
        if prompt.trim().is_empty() {
            return Err(ConfigError::Missing("system prompt"));
        }
        Ok(config.with_system_prompt(prompt))
    }
}

fn flavor(arg: FlavorArg, api_version: &str) -> ApiFlavor {
    match arg {
        FlavorArg::Azure => ApiFlavor::Azure {
            api_version: api_version.to_string(),
        },
        FlavorArg::Openai => ApiFlavor::OpenAi,
    }
}
