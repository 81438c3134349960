//! Query → search → concurrent batched generation → merged entries.
//!
//! Each generation batch is an independent task with its own retry budget.
//! A batch that exhausts its attempts contributes nothing; the rest still
//! count, so a retrieval call only fails when there is nothing to fan out.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;

use crate::embedder::EmbeddingProvider;
use crate::error::{ConfigError, ProviderError, RetrievalError};
use crate::generator::{
    parse_entries, user_message, GenerationProvider, GenerationRequest, StructuredEntry,
    DEFAULT_SYSTEM_PROMPT,
};
use crate::retry::RetryPolicy;
use crate::vector_store::{CollectionName, VectorIndex};

const PREVIEW_CHARS: usize = 200;

/// Fan-out sizing and sampling settings.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    batch_size: usize,
    temperature: f32,
    system_prompt: Arc<str>,
}

impl RetrievalConfig {
    /// Rejects a zero batch size and temperatures outside `0.0..=2.0`.
    pub fn new(batch_size: usize, temperature: f32) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::Zero("generation batch size"));
        }
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid {
                name: "temperature",
                reason: format!("{temperature} is outside 0.0..=2.0"),
            });
        }
        Ok(Self {
            batch_size,
            temperature,
            system_prompt: Arc::from(DEFAULT_SYSTEM_PROMPT),
        })
    }

    /// Replaces the instruction sent with every batch.
    pub fn with_system_prompt(mut self, prompt: impl Into<Arc<str>>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Hit texts per generation request.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Instruction sent as the system message.
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            temperature: 0.3,
            system_prompt: Arc::from(DEFAULT_SYSTEM_PROMPT),
        }
    }
}

/// Terminal state of one generation batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Parsed, non-empty entries.
    Succeeded(Vec<StructuredEntry>),
    /// Retry budget spent or a non-retryable failure.
    Exhausted {
        /// Attempts made; zero when the task itself died.
        attempts: u32,
        /// Last failure.
        error: String,
    },
}

impl BatchOutcome {
    /// Whether the batch produced entries.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Everything one retrieval call produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalRun {
    /// Entries from successful batches, in batch order.
    #[serde(skip)]
    pub entries: Vec<StructuredEntry>,
    /// Search hits fanned out.
    pub hits: usize,
    /// Generation batches submitted.
    pub batches: usize,
    /// Zero-based indices of exhausted batches.
    pub failed_batches: Vec<usize>,
}

/// Coordinates the query embedding, index search and generation fan-out.
pub struct RetrievalOrchestrator {
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
    embed_retry: RetryPolicy,
    generation_retry: RetryPolicy,
}

impl RetrievalOrchestrator {
    /// Uses the default embedding and generation retry policies.
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            generator,
            index,
            config,
            embed_retry: RetryPolicy::embedding(),
            generation_retry: RetryPolicy::generation(),
        }
    }

    /// Overrides the policy around the query embedding.
    pub fn with_embed_retry(mut self, retry: RetryPolicy) -> Self {
        self.embed_retry = retry;
        self
    }

    /// Overrides the per-batch generation policy.
    pub fn with_generation_retry(mut self, retry: RetryPolicy) -> Self {
        self.generation_retry = retry;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Collection searched by this orchestrator.
    pub fn collection(&self) -> &CollectionName {
        self.index.collection()
    }

    /// Entries generated from the `top_k` hits nearest to `query`.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<StructuredEntry>, RetrievalError> {
        Ok(self.run(query, top_k).await?.entries)
    }

    /// Like [`Self::retrieve`], also reporting hit and batch counts.
    pub async fn run(&self, query: &str, top_k: usize) -> Result<RetrievalRun, RetrievalError> {
        let vector = self.embed_query(query).await?;
        let hits = self
            .index
            .search(&vector, top_k)
            .await
            .map_err(RetrievalError::Search)?;
        tracing::info!(
            collection = %self.index.collection(),
            "retrieved {} chunk(s) for top_k={top_k}",
            hits.len()
        );
        if hits.is_empty() {
            return Ok(RetrievalRun::default());
        }

        let hit_count = hits.len();
        let texts: Vec<String> = hits.into_iter().map(|hit| hit.text).collect();
        let outcomes = self.generate(texts).await;
        let batches = outcomes.len();
        let (entries, failed_batches) = merge_outcomes(outcomes);
        Ok(RetrievalRun {
            entries,
            hits: hit_count,
            batches,
            failed_batches,
        })
    }

    /// Splits `texts` into batches and runs every batch as its own task.
    /// Outcomes are returned in submission order once all tasks finish.
    pub async fn generate(&self, texts: Vec<String>) -> Vec<BatchOutcome> {
        let batches: Vec<Vec<String>> = texts
            .chunks(self.config.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        tracing::info!(
            "generating over {} batch(es) of up to {} chunk(s)",
            batches.len(),
            self.config.batch_size
        );

        let tasks: Vec<_> = batches
            .into_iter()
            .enumerate()
            .map(|(idx, batch)| {
                let generator = Arc::clone(&self.generator);
                let system = Arc::clone(&self.config.system_prompt);
                let temperature = self.config.temperature;
                let retry = self.generation_retry;
                tokio::spawn(async move {
                    run_batch(generator.as_ref(), &system, temperature, retry, idx, batch).await
                })
            })
            .collect();

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|err| BatchOutcome::Exhausted {
                    attempts: 0,
                    error: format!("batch task failed: {err}"),
                })
            })
            .collect()
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, RetrievalError> {
        let embedder = self.embedder.as_ref();
        self.embed_retry
            .run("query embedding", |_| async move {
                let mut vectors = embedder.embed(&[query]).await?;
                match vectors.pop() {
                    Some(vector) if vectors.is_empty() && !vector.is_empty() => Ok(vector),
                    _ => Err(ProviderError::Malformed(
                        "expected exactly one query vector".into(),
                    )),
                }
            })
            .await
            .map_err(|err| RetrievalError::QueryEmbedding(err.into_inner()))
    }
}

async fn run_batch(
    generator: &dyn GenerationProvider,
    system: &str,
    temperature: f32,
    retry: RetryPolicy,
    idx: usize,
    texts: Vec<String>,
) -> BatchOutcome {
    let user = user_message(&texts);
    let request = GenerationRequest {
        system,
        user: &user,
        temperature,
    };
    let label = format!("generation batch {}", idx + 1);
    let result = retry
        .run(&label, |attempt| async move {
            let raw = generator.complete(&request).await?;
            tracing::debug!(
                batch = idx + 1,
                attempt,
                "response preview: {}",
                preview(&raw)
            );
            parse_entries(&raw).map_err(ProviderError::from)
        })
        .await;

    match result {
        Ok(entries) => {
            tracing::info!(batch = idx + 1, "parsed {} entr(ies)", entries.len());
            BatchOutcome::Succeeded(entries)
        }
        Err(err) => {
            tracing::warn!(batch = idx + 1, "batch exhausted: {err}");
            BatchOutcome::Exhausted {
                attempts: err.attempts,
                error: err.source.to_string(),
            }
        }
    }
}

/// Concatenates successful batches in order and collects failed indices.
pub fn merge_outcomes(outcomes: Vec<BatchOutcome>) -> (Vec<StructuredEntry>, Vec<usize>) {
    let total = outcomes.len();
    let mut entries = Vec::new();
    let mut failed = Vec::new();
    for (idx, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            BatchOutcome::Succeeded(batch) => entries.extend(batch),
            BatchOutcome::Exhausted { .. } => failed.push(idx),
        }
    }
    if failed.is_empty() {
        tracing::info!("all {total} batch(es) succeeded, {} entr(ies)", entries.len());
    } else {
        tracing::warn!(
            failed = failed.len(),
            "{} of {total} batch(es) failed: {failed:?}",
            failed.len()
        );
    }
    (entries, failed)
}

fn preview(raw: &str) -> String {
    raw.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::tests::FakeEmbedder;
    use crate::error::StoreError;
    use crate::retry::Backoff;
    use crate::vector_store::{CollectionName, Distance, MemoryIndex, VectorPoint};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers each batch with one entry naming its first chunk. Batches whose
    /// first chunk starts with `broken` always get prose back; `fenced` ones
    /// get a fenced reply after one malformed attempt.
    #[derive(Default)]
    struct ScriptedChat {
        attempts: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl GenerationProvider for ScriptedChat {
        async fn complete(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
            let first = request
                .user
                .strip_prefix(crate::generator::USER_PREAMBLE)
                .and_then(|rest| rest.split("\n\n").next())
                .unwrap_or_default()
                .to_string();
            let seen = {
                let mut attempts = self.attempts.lock().unwrap();
                let seen = attempts.entry(first.clone()).or_insert(0);
                *seen += 1;
                *seen
            };
            if first.starts_with("broken") {
                return Ok("I could not find anything relevant.".into());
            }
            if first.starts_with("fenced") && seen == 1 {
                return Ok("```json\n[]\n```".into());
            }
            let body = json!([{ "first": first }]).to_string();
            Ok(if first.starts_with("fenced") {
                format!("```json\n{body}\n```")
            } else {
                body
            })
        }
    }

    fn point(id: u64, text: &str, vector: Vec<f32>) -> VectorPoint {
        let mut payload = Map::new();
        payload.insert("text".into(), Value::String(text.into()));
        VectorPoint {
            id,
            vector,
            payload,
        }
    }

    /// Index whose hits come back in `texts` order for the query `"q"`
    /// (embedded by [`FakeEmbedder`] as `[1.0, 1.0]`).
    async fn index_with(texts: &[&str]) -> Arc<MemoryIndex> {
        let index = MemoryIndex::new(CollectionName::new("retrieval_test").unwrap());
        index.create_collection(2, Distance::Dot).await.unwrap();
        let points: Vec<VectorPoint> = texts
            .iter()
            .enumerate()
            .map(|(idx, text)| point(idx as u64, text, vec![(texts.len() - idx) as f32, 0.0]))
            .collect();
        index.upsert_batch(&points).await.unwrap();
        Arc::new(index)
    }

    fn orchestrator(index: Arc<dyn VectorIndex>, batch_size: usize) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            Arc::new(FakeEmbedder::default()),
            Arc::new(ScriptedChat::default()),
            index,
            RetrievalConfig::new(batch_size, 0.3).unwrap(),
        )
        .with_embed_retry(RetryPolicy::embedding().with_backoff(Backoff::None))
        .with_generation_retry(RetryPolicy::generation().with_backoff(Backoff::None))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn partial_failures_keep_surviving_batches() {
        let index = index_with(&[
            "alpha", "a2", "broken one", "b2", "gamma", "g2", "broken two", "d2", "epsilon",
            "e2",
        ])
        .await;
        let run = orchestrator(index, 2).run("q", 10).await.unwrap();

        assert_eq!(run.hits, 10);
        assert_eq!(run.batches, 5);
        assert_eq!(run.failed_batches, vec![1, 3]);
        assert_eq!(
            run.entries,
            vec![
                json!({"first": "alpha"}),
                json!({"first": "gamma"}),
                json!({"first": "epsilon"}),
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn malformed_reply_is_retried_once() {
        let index = index_with(&["fenced reply", "other"]).await;
        let entries = orchestrator(index, 5).retrieve("q", 10).await.unwrap();
        assert_eq!(entries, vec![json!({"first": "fenced reply"})]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn top_k_bounds_the_fan_out() {
        let index = index_with(&["one", "two", "three", "four", "five", "six"]).await;
        let run = orchestrator(index, 5).run("q", 3).await.unwrap();
        assert_eq!(run.hits, 3);
        assert_eq!(run.batches, 1);
        assert_eq!(run.entries, vec![json!({"first": "one"})]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_hits_yield_empty_result() {
        let index = index_with(&[]).await;
        let run = orchestrator(index, 5).run("q", 10).await.unwrap();
        assert!(run.entries.is_empty());
        assert_eq!(run.batches, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn query_embedding_failure_is_an_error() {
        let index = index_with(&["alpha"]).await;
        let err = orchestrator(index, 5)
            .retrieve("doomed query", 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::QueryEmbedding(ProviderError::Server { status: 503, .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn search_failure_is_an_error() {
        let index = Arc::new(MemoryIndex::new(CollectionName::new("absent").unwrap()));
        let err = orchestrator(index, 5).retrieve("q", 10).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::Search(StoreError::MissingCollection(_))
        ));
    }

    /// Holds every call for `delay` and records the peak number in flight.
    struct SlowChat {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl GenerationProvider for SlowChat {
        async fn complete(&self, _request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"[{"ok": true}]"#.into())
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn generation_batches_run_concurrently() {
        let index = index_with(&["a", "b", "c", "d", "e", "f", "g", "h"]).await;
        let chat = Arc::new(SlowChat {
            delay: Duration::from_secs(3),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let orchestrator = RetrievalOrchestrator::new(
            Arc::new(FakeEmbedder::default()),
            chat.clone(),
            index,
            RetrievalConfig::new(2, 0.3).unwrap(),
        );

        let started = tokio::time::Instant::now();
        let run = orchestrator.run("q", 8).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(run.batches, 4);
        assert_eq!(run.entries.len(), 4);
        assert_eq!(chat.peak.load(Ordering::SeqCst), 4);
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(6), "batches ran serially: {elapsed:?}");
    }

    #[test]
    fn merge_preserves_batch_order() {
        let (entries, failed) = merge_outcomes(vec![
            BatchOutcome::Succeeded(vec![json!(1), json!(2)]),
            BatchOutcome::Exhausted {
                attempts: 2,
                error: "malformed".into(),
            },
            BatchOutcome::Succeeded(vec![json!(3)]),
        ]);
        assert_eq!(entries, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(failed, vec![1]);
    }

    #[test]
    fn config_rejects_degenerate_values() {
        assert_eq!(
            RetrievalConfig::new(0, 0.3).unwrap_err(),
            ConfigError::Zero("generation batch size")
        );
        assert!(RetrievalConfig::new(5, 3.5).is_err());
        let config = RetrievalConfig::default().with_system_prompt("custom");
        assert_eq!(config.system_prompt(), "custom");
        assert_eq!(config.batch_size(), 5);
    }
}
