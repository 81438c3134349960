use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dfmea_rag::generator::USER_PREAMBLE;
use dfmea_rag::pipeline::{ingest, IngestSettings, Pipeline};
use dfmea_rag::{
    Backoff, BatchConfig, ChunkConfig, ChunkEngine, Cl100kTokenizer, CollectionName, Distance, EmbeddingProvider,
    GenerationProvider, GenerationRequest, MemoryIndex, ProviderError, Record, RetrievalConfig,
    RetryPolicy, SourceFiles, Tokenizer, VectorIndex,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

/// One token per char.
struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.chars().map(u32::from).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .map(|&t| char::from_u32(t).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// `[1.0, len/1000]`; rejects any batch holding a text that mentions `doomed`.
#[derive(Default)]
struct StubEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if inputs.iter().any(|text| text.contains("doomed")) {
            return Err(ProviderError::Rejected {
                status: 400,
                body: "content filter".into(),
            });
        }
        Ok(inputs
            .iter()
            .map(|text| vec![1.0, text.chars().count() as f32 / 1000.0])
            .collect())
    }
}

/// Replies with one entry counting the chunks it was given.
struct CountingChat;

#[async_trait]
impl GenerationProvider for CountingChat {
    async fn complete(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
        let body = request
            .user
            .strip_prefix(USER_PREAMBLE)
            .ok_or_else(|| ProviderError::Malformed("missing preamble".into()))?;
        let chunks = body.split("\n\n").count();
        Ok(format!("```json\n[{{\"chunks\": {chunks}}}]\n```"))
    }
}

fn settings(batch_size: usize) -> IngestSettings {
    IngestSettings {
        batch: BatchConfig::new(batch_size, Duration::ZERO).expect("batch config"),
        embed_retry: RetryPolicy::embedding().with_backoff(Backoff::None),
        upsert_limit: 500,
        distance: Distance::Cosine,
    }
}

fn pipeline(
    index: Arc<MemoryIndex>,
    chunk: ChunkConfig,
    batch_size: usize,
) -> (Pipeline<CharTokenizer>, Arc<StubEmbedder>) {
    let embedder = Arc::new(StubEmbedder::default());
    let pipeline = Pipeline::new(
        ChunkEngine::new(CharTokenizer, chunk),
        embedder.clone(),
        Arc::new(CountingChat),
        index,
        RetrievalConfig::new(5, 0.3).expect("retrieval config"),
        settings(batch_size),
    )
    .with_generation_retry(RetryPolicy::generation().with_backoff(Backoff::None));
    (pipeline, embedder)
}

fn memory_index(name: &str) -> Arc<MemoryIndex> {
    Arc::new(MemoryIndex::new(CollectionName::new(name).expect("name")))
}

fn rows(values: Value) -> Vec<Record> {
    values
        .as_array()
        .expect("array")
        .iter()
        .map(|row| row.as_object().expect("object").clone())
        .collect()
}

#[tokio::test(flavor = "current_thread")]
async fn end_to_end_from_files_drops_session_collection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kb_path = dir.path().join("knowledge_bank.json");
    let fi_path = dir.path().join("field_issues.jsonl");
    fs::write(
        &kb_path,
        json!([
            {"Component": "Battery", "Failure Mode": "Swelling", "Severity": 8},
            {"Component": "Charger", "Failure Mode": "No charge", "Severity": 6},
            {"Component": "Display", "Failure Mode": "Flicker", "Notes": null},
        ])
        .to_string(),
    )
    .expect("write kb");
    fs::write(
        &fi_path,
        concat!(
            r#"{"product": "TC57", "fault_code": "F12", "part_category": "battery", "fault_type": "overheat"}"#,
            "\n",
            r#"{"product": "TC57", "fault_code": "F40", "part_category": "display", "fault_type": "dead pixels"}"#,
            "\n\n",
            r#"{"product": "MC93", "fault_code": "F07", "part_category": "scanner", "fault_type": "no read"}"#,
            "\n",
            r#"{"product": "MC93", "fault_code": "F09", "part_category": "keypad", "fault_type": "stuck key"}"#,
            "\n",
        ),
    )
    .expect("write fi");

    let (knowledge_bank, field_issues) = SourceFiles::new(&kb_path, &fi_path)
        .expect("sources")
        .load()
        .expect("load");
    let index = memory_index("dfmea_collection_e2e00001");
    let (pipeline, embedder) = pipeline(index.clone(), ChunkConfig::default(), 2);

    let outcome = pipeline
        .run(&knowledge_bank, &field_issues, "battery failures", 100, false)
        .await
        .expect("run");

    assert_eq!(outcome.ingest.knowledge_bank_records, 3);
    assert_eq!(outcome.ingest.field_issue_records, 4);
    assert_eq!(outcome.ingest.chunking.records_chunked, 7);
    assert_eq!(outcome.ingest.chunking.slices, 7);
    assert_eq!(outcome.ingest.embedding.batches, 4);
    assert_eq!(outcome.ingest.dimension, Some(2));
    assert_eq!(outcome.ingest.upsert.points_written, 7);
    // four ingest batches plus the query
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 5);

    assert_eq!(outcome.generate.retrieval.hits, 7);
    assert_eq!(outcome.generate.retrieval.batches, 2);
    assert!(!outcome.generate.is_partial());
    assert_eq!(outcome.entries, vec![json!({"chunks": 5}), json!({"chunks": 2})]);
    assert!(!index.exists().await);
}

#[tokio::test(flavor = "current_thread")]
async fn rejected_embedding_batch_is_skipped() {
    let knowledge_bank = rows(json!([
        {"Component": "Battery"},
        {"Component": "Charger"},
        {"Component": "Display"},
    ]));
    let field_issues = rows(json!([
        {"note": "doomed row"},
        {"product": "TC57"},
        {"product": "TC52"},
        {"product": "MC93"},
    ]));
    let index = memory_index("dfmea_collection_skip0001");
    let (pipeline, embedder) = pipeline(index.clone(), ChunkConfig::default(), 2);

    let report = pipeline
        .ingest(&knowledge_bank, &field_issues)
        .await
        .expect("ingest");

    assert_eq!(report.embedding.batches, 4);
    assert_eq!(report.embedding.dropped_batches, 1);
    assert_eq!(report.embedding.dropped_chunks, 2);
    assert_eq!(report.upsert.points_written, 5);
    assert_eq!(index.len().await, Some(5));
    // rejected errors are not retried
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_records_are_sliced_with_shared_lineage() {
    let knowledge_bank = rows(json!([{ "note": "x".repeat(34) }]));
    let index = memory_index("dfmea_collection_slice001");
    let (pipeline, _) = pipeline(
        index.clone(),
        ChunkConfig::new(16, 4).expect("chunk config"),
        50,
    );

    let report = pipeline.ingest(&knowledge_bank, &[]).await.expect("ingest");
    assert_eq!(report.chunking.records_chunked, 1);
    assert_eq!(report.chunking.total_tokens, 40);
    assert_eq!(report.chunking.slices, 3);

    let hits = index.search(&[1.0, 0.0], 10).await.expect("search");
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|hit| hit.text.chars().count() <= 16));
    assert!(hits
        .iter()
        .all(|hit| hit.metadata["id"] == hits[0].metadata["id"]));
    assert!(hits
        .iter()
        .all(|hit| hit.metadata["source"] == "knowledge_bank"));
}

#[tokio::test(flavor = "current_thread")]
async fn reingest_recreates_the_collection() {
    let records = rows(json!([{"Component": "Battery"}, {"Component": "Charger"}]));
    let index = memory_index("dfmea_collection_again001");
    let (pipeline, _) = pipeline(index.clone(), ChunkConfig::default(), 50);

    pipeline.ingest(&records, &[]).await.expect("first ingest");
    pipeline.ingest(&records, &[]).await.expect("second ingest");
    assert_eq!(index.len().await, Some(2));
}

#[tokio::test(flavor = "current_thread")]
async fn empty_inputs_skip_collection_and_generation() {
    let index = memory_index("dfmea_collection_empty001");
    let (pipeline, embedder) = pipeline(index.clone(), ChunkConfig::default(), 50);

    let outcome = pipeline
        .run(&[], &rows(json!([{"blank": "   ", "missing": null}])), "q", 10, false)
        .await
        .expect("run");

    assert_eq!(outcome.ingest.dimension, None);
    assert!(outcome.entries.is_empty());
    assert_eq!(outcome.generate.retrieval.batches, 0);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    assert!(!index.exists().await);
}

#[tokio::test(flavor = "current_thread")]
async fn multibyte_records_ingest_with_real_tokenizer() {
    let note = "Symptom: 触摸屏无响应 after drop 📱💥 画面がちらつく 𝄞. ".repeat(40);
    let knowledge_bank = rows(json!([{ "note": note }, {"Component": "Battery"}]));
    let engine = ChunkEngine::new(
        Cl100kTokenizer::new().expect("bundled ranks"),
        ChunkConfig::new(23, 5).expect("chunk config"),
    );
    let embedder = StubEmbedder::default();
    let index = MemoryIndex::new(CollectionName::new("dfmea_collection_utf8001").expect("name"));

    let report = ingest(&engine, &embedder, &index, &settings(50), &knowledge_bank, &[])
        .await
        .expect("ingest");

    assert_eq!(report.chunking.records_chunked, 2);
    assert!(report.chunking.slices > 2);
    assert_eq!(report.upsert.points_written, report.chunking.slices);
    assert_eq!(index.len().await, Some(report.chunking.slices));
}
