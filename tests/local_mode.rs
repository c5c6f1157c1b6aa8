#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// End-to-end retrieval against the local file backends

mod common;

use std::sync::Arc;
use tempfile::TempDir;

use common::{
    HashingEmbedder, guideline_corpus, init_test_tracing, local_config, numbered_corpus,
};
use medctx::RagError;
use medctx::backends::Backends;
use medctx::index::{BuildOrigin, SearchFilter};

async fn ingested(dir: &TempDir) -> (Backends, Arc<HashingEmbedder>) {
    init_test_tracing();
    let backends = Backends::open(&local_config(dir)).expect("local backends");
    let (documents, chunks) = guideline_corpus();
    backends.ingest(&documents, &chunks).await.expect("ingest");
    (backends, Arc::new(HashingEmbedder::new()))
}

#[tokio::test]
async fn query_matching_a_chunk_ranks_it_first() {
    let dir = TempDir::new().expect("temp dir");
    let (backends, embedder) = ingested(&dir).await;
    let build = backends
        .build_index(embedder.as_ref(), false)
        .await
        .expect("build");
    assert_eq!(build.origin, BuildOrigin::Built);
    assert_eq!(build.metadata.len(), 6);

    let (_, chunks) = guideline_corpus();
    let target = &chunks[3];
    let results = backends
        .retriever(embedder)
        .search(&target.augmented_chunk, 3, &SearchFilter::default())
        .await
        .expect("search");

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].chunk.chunk_id, target.chunk_id);
    assert_eq!(results[0].rank, 1);
    assert!((results[0].similarity_score - 1.0).abs() < 1e-5);
    assert_eq!(results[0].chunk.doc_title, "Type 2 diabetes in adults");
    assert_eq!(
        results.iter().map(|r| r.rank).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn second_build_reuses_the_index() {
    let dir = TempDir::new().expect("temp dir");
    let (backends, embedder) = ingested(&dir).await;

    backends
        .build_index(embedder.as_ref(), false)
        .await
        .expect("build");
    let calls = embedder.calls();
    assert!(calls > 0);

    let again = backends
        .build_index(embedder.as_ref(), false)
        .await
        .expect("reuse");
    assert_eq!(again.origin, BuildOrigin::Loaded);
    assert_eq!(embedder.calls(), calls);

    // A fresh process sees the persisted files.
    let reopened = Backends::open(&local_config(&dir)).expect("reopen");
    let loaded = reopened
        .build_index(embedder.as_ref(), false)
        .await
        .expect("load");
    assert_eq!(loaded.origin, BuildOrigin::Loaded);
    assert_eq!(loaded.embeddings.len(), 6);
    assert_eq!(embedder.calls(), calls);

    let forced = reopened
        .build_index(embedder.as_ref(), true)
        .await
        .expect("force");
    assert_eq!(forced.origin, BuildOrigin::Built);
    assert!(embedder.calls() > calls);
}

#[tokio::test]
async fn results_are_ordered_and_repeatable() {
    let dir = TempDir::new().expect("temp dir");
    let (backends, embedder) = ingested(&dir).await;
    backends
        .build_index(embedder.as_ref(), false)
        .await
        .expect("build");
    let retriever = backends.retriever(embedder);

    let first = retriever
        .search("blood pressure treatment", 5, &SearchFilter::default())
        .await
        .expect("search");
    let second = retriever
        .search("blood pressure treatment", 5, &SearchFilter::default())
        .await
        .expect("search");

    assert_eq!(first.len(), 5);
    assert!(
        first
            .windows(2)
            .all(|w| w[0].similarity_score >= w[1].similarity_score)
    );
    assert_eq!(first, second);
    assert_eq!(first[0].chunk.chunk_id, "ng136-0001");
}

#[tokio::test]
async fn top_k_bounds() {
    let dir = TempDir::new().expect("temp dir");
    let backends = Backends::open(&local_config(&dir)).expect("local backends");
    let (documents, chunks) = numbered_corpus(5);
    assert_eq!(chunks.len(), 10);
    backends.ingest(&documents, &chunks).await.expect("ingest");
    let embedder = Arc::new(HashingEmbedder::new());
    backends
        .build_index(embedder.as_ref(), false)
        .await
        .expect("build");
    let retriever = backends.retriever(embedder);

    let zero = retriever
        .search("condition3", 0, &SearchFilter::default())
        .await;
    assert!(matches!(zero, Err(RagError::InvalidArgument(_))));

    let all = retriever
        .search("condition3", 1000, &SearchFilter::default())
        .await
        .expect("search");
    assert_eq!(all.len(), 10);
    assert_eq!(all.last().map(|r| r.rank), Some(10));
}

#[tokio::test]
async fn search_before_indexing_is_empty() {
    let dir = TempDir::new().expect("temp dir");
    let (backends, embedder) = ingested(&dir).await;

    let results = backends
        .retriever(embedder)
        .search("asthma", 5, &SearchFilter::default())
        .await
        .expect("search");
    assert!(results.is_empty());
}

#[tokio::test]
async fn filters_restrict_results() {
    let dir = TempDir::new().expect("temp dir");
    let (backends, embedder) = ingested(&dir).await;
    backends
        .build_index(embedder.as_ref(), false)
        .await
        .expect("build");
    let retriever = backends.retriever(embedder);

    let sign = retriever
        .search(
            "treatment",
            10,
            &SearchFilter::default().with_source_org("SIGN"),
        )
        .await
        .expect("search");
    assert_eq!(sign.len(), 2);
    assert!(sign.iter().all(|r| r.chunk.doc_id == "sign158"));

    let recent = retriever
        .search(
            "treatment",
            10,
            &SearchFilter::default().published_between(Some("2019-01-01".to_string()), None),
        )
        .await
        .expect("search");
    assert_eq!(recent.len(), 4);
    assert!(recent.iter().all(|r| r.chunk.doc_id != "ng28"));
}

#[tokio::test]
async fn records_round_trip() {
    let dir = TempDir::new().expect("temp dir");
    let backends = Backends::open(&local_config(&dir)).expect("local backends");
    let (documents, mut chunks) = guideline_corpus();
    chunks[0].embedding = Some(HashingEmbedder::vector(&chunks[0].augmented_chunk));

    backends.ingest(&documents, &chunks).await.expect("ingest");

    assert_eq!(
        backends.records.load_documents().await.expect("load"),
        documents
    );
    assert_eq!(backends.records.load_chunks().await.expect("load"), chunks);
    assert_eq!(
        backends
            .records
            .get_document_by_id("ng28")
            .await
            .expect("get"),
        Some(documents[1].clone())
    );
    let asthma = backends
        .records
        .get_chunks_by_doc_id("sign158")
        .await
        .expect("chunks");
    assert_eq!(asthma, chunks[4..].to_vec());
}

#[tokio::test]
async fn embedding_failure_surfaces() {
    let dir = TempDir::new().expect("temp dir");
    let (backends, _) = ingested(&dir).await;
    let failing = HashingEmbedder::failing();

    let result = backends.build_index(&failing, false).await;
    assert!(matches!(result, Err(RagError::Embedding(_))));
    assert_eq!(backends.index.get_document_count().await.expect("count"), 0);
}
