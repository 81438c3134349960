//! Stage wiring used by the binaries: ingest, generate, and both end to end.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::chunker::{ChunkEngine, Tokenizer};
use crate::embedder::{BatchConfig, EmbeddingBatcher, EmbeddingProvider};
use crate::embeddings::common_dimension;
use crate::generator::{GenerationProvider, StructuredEntry};
use crate::manifest::{GenerateReport, IngestReport};
use crate::records::Record;
use crate::retrieval::{RetrievalConfig, RetrievalOrchestrator};
use crate::retry::RetryPolicy;
use crate::vector_store::{points_from_embedded, Distance, VectorIndex, DEFAULT_UPSERT_BATCH};

/// Knobs for the write path.
#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    /// Embedding batch size and cooldown.
    pub batch: BatchConfig,
    /// Policy around each embedding call, including the query embedding.
    pub embed_retry: RetryPolicy,
    /// Points per upsert request.
    pub upsert_limit: usize,
    /// Collection metric.
    pub distance: Distance,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            embed_retry: RetryPolicy::embedding(),
            upsert_limit: DEFAULT_UPSERT_BATCH,
            distance: Distance::Cosine,
        }
    }
}

/// Reports and entries from an end-to-end run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Write-path report.
    pub ingest: IngestReport,
    /// Read-path report.
    pub generate: GenerateReport,
    /// Generated entries.
    pub entries: Vec<StructuredEntry>,
}

/// Chunking, embedding and retrieval bound to one collection.
pub struct Pipeline<T> {
    engine: ChunkEngine<T>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    orchestrator: RetrievalOrchestrator,
    settings: IngestSettings,
}

impl<T: Tokenizer> Pipeline<T> {
    /// The orchestrator shares `embedder` and `index` with the write path.
    pub fn new(
        engine: ChunkEngine<T>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        index: Arc<dyn VectorIndex>,
        retrieval: RetrievalConfig,
        settings: IngestSettings,
    ) -> Self {
        let orchestrator = RetrievalOrchestrator::new(
            Arc::clone(&embedder),
            generator,
            Arc::clone(&index),
            retrieval,
        )
        .with_embed_retry(settings.embed_retry);
        Self {
            engine,
            embedder,
            index,
            orchestrator,
            settings,
        }
    }

    /// Overrides the per-batch generation policy.
    pub fn with_generation_retry(mut self, retry: RetryPolicy) -> Self {
        self.orchestrator = self.orchestrator.with_generation_retry(retry);
        self
    }

    /// Collection handle.
    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    /// See [`ingest`].
    pub async fn ingest(
        &self,
        knowledge_bank: &[Record],
        field_issues: &[Record],
    ) -> Result<IngestReport> {
        ingest(
            &self.engine,
            self.embedder.as_ref(),
            self.index.as_ref(),
            &self.settings,
            knowledge_bank,
            field_issues,
        )
        .await
    }

    /// Retrieval and generation over the current collection.
    pub async fn generate(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<(Vec<StructuredEntry>, GenerateReport)> {
        generate(&self.orchestrator, query, top_k).await
    }

    /// Ingest followed by generation. The collection is dropped afterwards
    /// unless `keep_collection` is set, including when generation fails.
    pub async fn run(
        &self,
        knowledge_bank: &[Record],
        field_issues: &[Record],
        query: &str,
        top_k: usize,
        keep_collection: bool,
    ) -> Result<PipelineOutcome> {
        let ingest = self.ingest(knowledge_bank, field_issues).await?;
        let collection = self.index.collection();

        if ingest.points_written() == 0 {
            tracing::warn!(%collection, "nothing was indexed; skipping generation");
            if ingest.dimension.is_some() && !keep_collection {
                self.drop_collection().await;
            }
            let generate = GenerateReport::new(collection, query, top_k, &Default::default());
            return Ok(PipelineOutcome {
                ingest,
                generate,
                entries: Vec::new(),
            });
        }

        let generated = self.generate(query, top_k).await;
        if !keep_collection {
            self.drop_collection().await;
        }
        let (entries, generate) = generated?;
        Ok(PipelineOutcome {
            ingest,
            generate,
            entries,
        })
    }

    async fn drop_collection(&self) {
        drop_collection(self.index.as_ref()).await;
    }
}

/// Deletes the collection, logging a failure instead of returning it.
/// Returns whether the delete succeeded.
pub async fn drop_collection(index: &dyn VectorIndex) -> bool {
    match index.delete_collection().await {
        Ok(()) => {
            tracing::info!(collection = %index.collection(), "collection dropped");
            true
        }
        Err(err) => {
            tracing::warn!(
                collection = %index.collection(),
                "failed to drop collection: {err}"
            );
            false
        }
    }
}

/// Chunks, embeds and stores both record sets in a freshly created
/// collection. Nothing is created when no chunk could be embedded.
pub async fn ingest<T: Tokenizer>(
    engine: &ChunkEngine<T>,
    embedder: &dyn EmbeddingProvider,
    index: &dyn VectorIndex,
    settings: &IngestSettings,
    knowledge_bank: &[Record],
    field_issues: &[Record],
) -> Result<IngestReport> {
    let (chunks, chunking) = engine.run(knowledge_bank, field_issues);

    let outcome = EmbeddingBatcher::new(embedder, engine.tokenizer(), settings.batch)
        .with_retry(settings.embed_retry)
        .embed(chunks)
        .await;

    let collection = index.collection();
    if outcome.embedded.is_empty() {
        tracing::warn!(%collection, "no chunks were embedded; skipping collection setup");
        return Ok(IngestReport::empty(
            collection,
            knowledge_bank.len(),
            field_issues.len(),
            chunking,
            outcome,
        ));
    }
    let Some(dim) = common_dimension(&outcome.embedded) else {
        bail!("embedding provider returned vectors of differing widths");
    };

    index
        .create_collection(dim, settings.distance)
        .await
        .with_context(|| format!("failed to create collection {collection}"))?;
    let points = points_from_embedded(&outcome.embedded);
    let upsert = index.upsert(&points, settings.upsert_limit).await;
    tracing::info!(
        %collection,
        written = upsert.points_written,
        skipped = upsert.points_skipped,
        "ingest complete"
    );

    Ok(IngestReport {
        collection: collection.to_string(),
        knowledge_bank_records: knowledge_bank.len(),
        field_issue_records: field_issues.len(),
        chunking,
        embedding: outcome,
        dimension: Some(dim),
        upsert,
    })
}

/// Runs one retrieval and wraps it in a report.
pub async fn generate(
    orchestrator: &RetrievalOrchestrator,
    query: &str,
    top_k: usize,
) -> Result<(Vec<StructuredEntry>, GenerateReport)> {
    let collection = orchestrator.collection();
    let mut run = orchestrator
        .run(query, top_k)
        .await
        .with_context(|| format!("retrieval against {collection} failed"))?;
    let report = GenerateReport::new(collection, query, top_k, &run);
    if report.is_partial() {
        tracing::warn!(
            failed = run.failed_batches.len(),
            batches = run.batches,
            "generation finished with lost batches"
        );
    }
    let entries = std::mem::take(&mut run.entries);
    Ok((entries, report))
}

/// Writes `entries` as a pretty JSON array to `output`, or stdout when absent.
pub fn write_entries(entries: &[StructuredEntry], output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(entries).context("failed to serialize entries")?;
    match output {
        Some(path) => {
            fs::write(path, json + "\n")
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), entries = entries.len(), "entries written");
        }
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{json}").context("failed to write entries to stdout")?;
        }
    }
    Ok(())
}
