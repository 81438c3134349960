use anyhow::{bail, Context, Result};
use clap::Parser;
use dfmea_rag::controls::{ChunkArgs, EmbeddingArgs, QdrantArgs, SourceArgs};
use dfmea_rag::pipeline::{ingest, IngestSettings};
use dfmea_rag::{telemetry, ChunkEngine, Cl100kTokenizer, Distance, QdrantIndex, SessionId};

#[derive(Parser, Debug)]
#[command(
    name = "dfmea-ingest",
    about = "Chunk, embed and index knowledge bank and field issue records"
)]
struct IngestCli {
    #[command(flatten)]
    sources: SourceArgs,

    #[command(flatten)]
    chunk: ChunkArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    qdrant: QdrantArgs,

    /// Reuse a session id instead of generating one
    #[arg(long, env = "DFMEA_SESSION_ID")]
    session_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = IngestCli::parse();

    let sources = cli.sources.build_sources()?;
    let session = match &cli.session_id {
        Some(id) => SessionId::new(id.as_str())?,
        None => SessionId::generate(),
    };
    let collection = cli.qdrant.session_collection(&session)?;
    let settings = IngestSettings {
        batch: cli.embedding.build_batch_config()?,
        upsert_limit: cli.qdrant.upsert_limit()?,
        distance: Distance::Cosine,
        ..IngestSettings::default()
    };
    let engine = ChunkEngine::new(
        Cl100kTokenizer::new()?,
        cli.chunk.build_chunk_config()?,
    );
    let embedder = cli.embedding.build_provider()?;
    let index = QdrantIndex::new(&cli.qdrant.build_qdrant_config()?, collection.clone())?;

    let (knowledge_bank, field_issues) = sources.load()?;
    let report = ingest(
        &engine,
        &embedder,
        &index,
        &settings,
        &knowledge_bank,
        &field_issues,
    )
    .await?;

    eprintln!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize ingest report")?
    );
    let Some(indexed) = report.indexed_collection() else {
        bail!("no chunks were embedded, so collection {collection} was not created");
    };
    println!("{indexed}");
    Ok(())
}
