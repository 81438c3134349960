//! Batched embedding with retry and cooldown pacing.

pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::chunker::{TextChunk, Tokenizer};
use crate::embeddings::{EmbeddedChunk, UsageSummary};
use crate::error::{ConfigError, ProviderError};
use crate::retry::{RetryError, RetryPolicy};

/// Anything that turns texts into vectors, positionally aligned with the inputs.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds `inputs`, returning one vector per input in the same order.
    async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Batch sizing and pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    batch_size: usize,
    cooldown: Duration,
}

impl BatchConfig {
    /// Rejects a zero batch size.
    pub fn new(batch_size: usize, cooldown: Duration) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::Zero("embedding batch size"));
        }
        Ok(Self {
            batch_size,
            cooldown,
        })
    }

    /// Chunks per provider call.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Pause after every batch.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            cooldown: Duration::from_secs(2),
        }
    }
}

/// Result of embedding a chunk set; dropped batches are counted, not raised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedOutcome {
    /// Successfully embedded chunks, in batch order.
    #[serde(skip)]
    pub embedded: Vec<EmbeddedChunk>,
    /// Batches attempted.
    pub batches: usize,
    /// Batches abandoned after retries or a non-retryable error.
    pub dropped_batches: usize,
    /// Chunks lost with those batches.
    pub dropped_chunks: usize,
    /// Token usage over `embedded`.
    pub usage: UsageSummary,
}

/// Sequential batch embedder.
pub struct EmbeddingBatcher<'a, T> {
    provider: &'a dyn EmbeddingProvider,
    tokenizer: &'a T,
    config: BatchConfig,
    retry: RetryPolicy,
}

impl<'a, T: Tokenizer> EmbeddingBatcher<'a, T> {
    /// Uses [`RetryPolicy::embedding`] unless overridden.
    pub fn new(provider: &'a dyn EmbeddingProvider, tokenizer: &'a T, config: BatchConfig) -> Self {
        Self {
            provider,
            tokenizer,
            config,
            retry: RetryPolicy::embedding(),
        }
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Embeds chunks batch by batch, pausing for the cooldown after each one.
    ///
    /// A batch that cannot be embedded is logged and dropped; the remaining
    /// batches still run.
    pub async fn embed(&self, chunks: Vec<TextChunk>) -> EmbedOutcome {
        let total = chunks.len();
        let batch_count = total.div_ceil(self.config.batch_size);
        tracing::info!(
            "embedding {total} chunks in {batch_count} batch(es) of up to {}",
            self.config.batch_size
        );

        let mut outcome = EmbedOutcome {
            embedded: Vec::with_capacity(total),
            ..EmbedOutcome::default()
        };
        let mut pending = chunks.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<TextChunk> = pending.by_ref().take(self.config.batch_size).collect();
            outcome.batches += 1;
            let batch_no = outcome.batches;
            match self.embed_batch(batch_no, &batch).await {
                Ok(vectors) => {
                    for (chunk, embedding) in batch.into_iter().zip(vectors) {
                        let token_count = self.tokenizer.count(&chunk.text);
                        outcome.embedded.push(EmbeddedChunk {
                            text: chunk.text,
                            embedding,
                            metadata: chunk.metadata,
                            token_count,
                        });
                    }
                    tracing::debug!("batch {batch_no}/{batch_count} embedded");
                }
                Err(err) => {
                    tracing::warn!(
                        "batch {batch_no}/{batch_count} dropped ({} chunks): {err}",
                        batch.len()
                    );
                    outcome.dropped_batches += 1;
                    outcome.dropped_chunks += batch.len();
                }
            }
            if !self.config.cooldown.is_zero() {
                tokio::time::sleep(self.config.cooldown).await;
            }
        }

        outcome.usage = UsageSummary::from_chunks(&outcome.embedded);
        outcome.usage.log();
        if outcome.dropped_batches > 0 {
            tracing::warn!(
                dropped_batches = outcome.dropped_batches,
                dropped_chunks = outcome.dropped_chunks,
                "some embedding batches were lost"
            );
        }
        outcome
    }

    async fn embed_batch(
        &self,
        batch_no: usize,
        batch: &[TextChunk],
    ) -> Result<Vec<Vec<f32>>, RetryError> {
        let inputs: Vec<&str> = batch.iter().map(|chunk| chunk.text.as_str()).collect();
        let inputs = &inputs;
        let provider = self.provider;
        let label = format!("embedding batch {batch_no}");
        self.retry
            .run(&label, |_| async move {
                let vectors = provider.embed(inputs).await?;
                if vectors.len() != inputs.len() {
                    return Err(ProviderError::Malformed(format!(
                        "{} vectors for {} inputs",
                        vectors.len(),
                        inputs.len()
                    )));
                }
                Ok(vectors)
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chunker::tests::CharTokenizer;
    use crate::chunker::ChunkMetadata;
    use crate::records::Source;
    use crate::retry::Backoff;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Embeds `text` as `[len, 1.0]`; texts starting with `flaky` fail
    /// transiently twice, texts starting with `doomed` always fail.
    #[derive(Default)]
    pub(crate) struct FakeEmbedder {
        failures: Mutex<HashMap<String, u32>>,
        pub(crate) calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.lock().unwrap().push(inputs.len());
            for input in inputs {
                if input.starts_with("doomed") {
                    return Err(ProviderError::Server {
                        status: 503,
                        body: "overloaded".into(),
                    });
                }
                if input.starts_with("flaky") {
                    let mut failures = self.failures.lock().unwrap();
                    let seen = failures.entry(input.to_string()).or_insert(0);
                    if *seen < 2 {
                        *seen += 1;
                        return Err(ProviderError::RateLimited("slow down".into()));
                    }
                }
            }
            Ok(inputs
                .iter()
                .map(|input| vec![input.chars().count() as f32, 1.0])
                .collect())
        }
    }

    pub(crate) fn chunk(text: &str, source: Source) -> TextChunk {
        TextChunk {
            text: text.into(),
            metadata: ChunkMetadata {
                id: Uuid::new_v4(),
                source,
            },
        }
    }

    fn instant_retry() -> RetryPolicy {
        RetryPolicy::embedding().with_backoff(Backoff::None)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transient_failures_converge() {
        let provider = FakeEmbedder::default();
        let batcher = EmbeddingBatcher::new(
            &provider,
            &CharTokenizer,
            BatchConfig::new(2, Duration::ZERO).unwrap(),
        )
        .with_retry(instant_retry());

        let outcome = batcher
            .embed(vec![
                chunk("flaky one", Source::FieldIssues),
                chunk("steady", Source::KnowledgeBank),
            ])
            .await;

        assert_eq!(outcome.embedded.len(), 2);
        assert_eq!(outcome.dropped_batches, 0);
        assert_eq!(*provider.calls.lock().unwrap(), vec![2, 2, 2]);
        assert_eq!(outcome.embedded[0].embedding, vec![9.0, 1.0]);
        assert_eq!(outcome.embedded[1].token_count, 6);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exhausted_batches_are_dropped_without_aborting() {
        let provider = FakeEmbedder::default();
        let batcher = EmbeddingBatcher::new(
            &provider,
            &CharTokenizer,
            BatchConfig::new(2, Duration::ZERO).unwrap(),
        )
        .with_retry(instant_retry());

        let outcome = batcher
            .embed(vec![
                chunk("alpha", Source::KnowledgeBank),
                chunk("beta", Source::KnowledgeBank),
                chunk("doomed", Source::FieldIssues),
                chunk("gamma", Source::FieldIssues),
                chunk("delta", Source::FieldIssues),
            ])
            .await;

        let texts: Vec<&str> = outcome.embedded.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["alpha", "beta", "delta"]);
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.dropped_batches, 1);
        assert_eq!(outcome.dropped_chunks, 2);
        // 1 + 5 attempts + 1
        assert_eq!(provider.calls.lock().unwrap().len(), 7);
        assert_eq!(outcome.usage.knowledge_bank_tokens, 9);
        assert_eq!(outcome.usage.field_issues_tokens, 5);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cooldown_follows_every_batch() {
        let provider = FakeEmbedder::default();
        let batcher = EmbeddingBatcher::new(
            &provider,
            &CharTokenizer,
            BatchConfig::new(1, Duration::from_secs(2)).unwrap(),
        )
        .with_retry(instant_retry());

        let started = tokio::time::Instant::now();
        let outcome = batcher
            .embed(vec![
                chunk("a", Source::KnowledgeBank),
                chunk("doomed", Source::KnowledgeBank),
                chunk("c", Source::KnowledgeBank),
            ])
            .await;

        assert_eq!(outcome.embedded.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert_eq!(
            BatchConfig::new(0, Duration::ZERO),
            Err(ConfigError::Zero("embedding batch size"))
        );
    }
}
