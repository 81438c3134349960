use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dfmea_rag::controls::{ChatArgs, EmbeddingArgs, QdrantArgs, RetrievalArgs};
use dfmea_rag::pipeline::{drop_collection, generate, write_entries};
use dfmea_rag::{telemetry, CollectionName, QdrantIndex, RetrievalOrchestrator, VectorIndex};

#[derive(Parser, Debug)]
#[command(
    name = "dfmea-generate",
    about = "Retrieve indexed chunks and generate DFMEA entries"
)]
struct GenerateCli {
    /// Collection written by dfmea-ingest
    #[arg(long, env = "DFMEA_COLLECTION")]
    collection: String,

    /// Write the JSON array here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Delete the collection once generation finishes
    #[arg(long, default_value_t = false)]
    drop_collection: bool,

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
    let cli = GenerateCli::parse();

    let collection = CollectionName::new(cli.collection.as_str())?;
    let config = cli.retrieval.build_retrieval_config()?;
    let embedder = Arc::new(cli.embedding.build_provider()?);
    let chat = Arc::new(cli.chat.build_provider(cli.embedding.flavor)?);
    let index = Arc::new(QdrantIndex::new(
        &cli.qdrant.build_qdrant_config()?,
        collection,
    )?);
    let orchestrator =
        RetrievalOrchestrator::new(embedder, chat, Arc::clone(&index) as Arc<dyn VectorIndex>, config);

    let generated = generate(&orchestrator, &cli.retrieval.query, cli.retrieval.top_k).await;
    let written = generated.and_then(|(entries, report)| {
        write_entries(&entries, cli.output.as_deref())?;
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize generate report")?
        );
        Ok(())
    });
    if cli.drop_collection {
        drop_collection(index.as_ref()).await;
    }
    written
}
