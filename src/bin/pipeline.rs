use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dfmea_rag::controls::{
    ChatArgs, ChunkArgs, EmbeddingArgs, QdrantArgs, RetrievalArgs, SourceArgs,
};
use dfmea_rag::pipeline::{write_entries, IngestSettings, Pipeline};
use dfmea_rag::{telemetry, ChunkEngine, Cl100kTokenizer, QdrantIndex, SessionId};

#[derive(Parser, Debug)]
#[command(
    name = "dfmea-pipeline",
    about = "Ingest records into a session collection and generate DFMEA entries from it"
)]
struct PipelineCli {
    /// Write the JSON array here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Leave the session collection in place after generation
    #[arg(long, default_value_t = false)]
    keep_collection: bool,

    #[command(flatten)]
    sources: SourceArgs,

    #[command(flatten)]
    chunk: ChunkArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    chat: ChatArgs,

    #[command(flatten)]
    qdrant: QdrantArgs,

    #[command(flatten)]
    retrieval: RetrievalArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = PipelineCli::parse();

    let sources = cli.sources.build_sources()?;
    let session = SessionId::generate();
    let collection = cli.qdrant.session_collection(&session)?;
    tracing::info!(%session, %collection, "starting end-to-end run");

    let settings = IngestSettings {
        batch: cli.embedding.build_batch_config()?,
        upsert_limit: cli.qdrant.upsert_limit()?,
        ..IngestSettings::default()
    };
    let pipeline = Pipeline::new(
        ChunkEngine::new(Cl100kTokenizer::new()?, cli.chunk.build_chunk_config()?),
        Arc::new(cli.embedding.build_provider()?),
        Arc::new(cli.chat.build_provider(cli.embedding.flavor)?),
        Arc::new(QdrantIndex::new(
            &cli.qdrant.build_qdrant_config()?,
            collection,
        )?),
        cli.retrieval.build_retrieval_config()?,
        settings,
    );

    let (knowledge_bank, field_issues) = sources.load()?;
    let outcome = pipeline
        .run(
            &knowledge_bank,
            &field_issues,
            &cli.retrieval.query,
            cli.retrieval.top_k,
            cli.keep_collection,
        )
        .await?;

    write_entries(&outcome.entries, cli.output.as_deref())?;
    let reports = serde_json::json!({
        "ingest": outcome.ingest,
        "generate": outcome.generate,
    });
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&reports).context("failed to serialize run reports")?
    );
    Ok(())
}
