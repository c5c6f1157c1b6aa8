use super::*;
use crate::embeddings::BatchPolicy;
use crate::index::{BuildRequest, IndexBuild, LocalVectorIndex};
use crate::test_support::{WordHashProvider, corpus};
use async_trait::async_trait;
use tempfile::TempDir;

const DIM: usize = 32;

async fn local_retriever(dir: &TempDir) -> (Retriever, Arc<WordHashProvider>) {
    let provider = Arc::new(WordHashProvider::new(DIM));
    let index = Arc::new(LocalVectorIndex::new(
        dir.path(),
        DIM,
        BatchPolicy::unthrottled(8),
    ));
    index
        .build_or_load_index(BuildRequest::from_chunks(corpus().1, false), provider.as_ref())
        .await
        .expect("build");
    (
        Retriever::new(StorageMode::Local, index, Arc::clone(&provider) as Arc<dyn EmbeddingProvider>),
        provider,
    )
}

/// Index that answers with fixed hits.
struct CannedIndex {
    hits: Vec<SearchHit>,
    delay: Duration,
}

#[async_trait]
impl VectorIndexBackend for CannedIndex {
    async fn build_or_load_index(
        &self,
        _request: BuildRequest,
        _embedder: &dyn EmbeddingProvider,
    ) -> Result<IndexBuild> {
        Err(RagError::InvalidArgument("read only".to_string()))
    }

    async fn search(
        &self,
        _query_embedding: &[f32],
        _top_k: usize,
        _filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        tokio::time::sleep(self.delay).await;
        Ok(self.hits.clone())
    }

    async fn metadata_at(&self, _position: usize) -> Result<Option<ChunkMetadata>> {
        Ok(None)
    }

    async fn get_document_count(&self) -> Result<usize> {
        Ok(self.hits.len())
    }

    async fn delete_index(&self) -> Result<()> {
        Ok(())
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

fn canned(hits: Vec<SearchHit>, delay: Duration) -> Retriever {
    Retriever::new(
        StorageMode::Managed,
        Arc::new(CannedIndex { hits, delay }),
        Arc::new(WordHashProvider::new(DIM)),
    )
}

#[tokio::test]
async fn ranks_start_at_one_and_scores_descend() {
    let dir = TempDir::new().expect("temp dir");
    let (retriever, _) = local_retriever(&dir).await;

    let results = retriever
        .search("metformin drug treatment for diabetes", 3, &SearchFilter::default())
        .await
        .expect("search");

    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().map(|r| r.rank).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(
        results
            .windows(2)
            .all(|w| w[0].similarity_score >= w[1].similarity_score)
    );
    assert_eq!(results[0].chunk.chunk_id, "ng28-0000");
}

#[tokio::test]
async fn repeated_queries_return_identical_results() {
    let dir = TempDir::new().expect("temp dir");
    let (retriever, _) = local_retriever(&dir).await;
    let filter = SearchFilter::default();

    let first = retriever.search("asthma", 4, &filter).await.expect("search");
    let second = retriever.search("asthma", 4, &filter).await.expect("search");
    assert_eq!(first, second);
}

#[tokio::test]
async fn zero_top_k_is_rejected_before_embedding() {
    let dir = TempDir::new().expect("temp dir");
    let (retriever, provider) = local_retriever(&dir).await;
    let calls = provider.calls();

    let result = retriever.search("asthma", 0, &SearchFilter::default()).await;
    assert!(matches!(result, Err(RagError::InvalidArgument(_))));
    assert_eq!(provider.calls(), calls);
}

#[tokio::test]
async fn large_top_k_returns_whole_corpus() {
    let dir = TempDir::new().expect("temp dir");
    let (retriever, _) = local_retriever(&dir).await;
    let results = retriever
        .search("guideline", 1000, &SearchFilter::default())
        .await
        .expect("search");
    assert_eq!(results.len(), 6);
}

#[tokio::test]
async fn filter_limits_results() {
    let dir = TempDir::new().expect("temp dir");
    let (retriever, _) = local_retriever(&dir).await;
    let filter = SearchFilter::default().with_doc_id("ng136");
    let results = retriever
        .search("treatment", 5, &filter)
        .await
        .expect("search");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.chunk.doc_id == "ng136"));
}

#[tokio::test]
async fn empty_corpus_returns_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let retriever = Retriever::new(
        StorageMode::Local,
        Arc::new(LocalVectorIndex::new(
            dir.path(),
            DIM,
            BatchPolicy::unthrottled(8),
        )),
        Arc::new(WordHashProvider::new(DIM)),
    );
    let results = retriever
        .search("anything", 5, &SearchFilter::default())
        .await
        .expect("search");
    assert!(results.is_empty());
}

#[tokio::test]
async fn embedding_errors_propagate_unchanged() {
    let dir = TempDir::new().expect("temp dir");
    let retriever = Retriever::new(
        StorageMode::Local,
        Arc::new(LocalVectorIndex::new(
            dir.path(),
            DIM,
            BatchPolicy::unthrottled(8),
        )),
        Arc::new(WordHashProvider::failing(DIM)),
    );
    let result = retriever.search("asthma", 3, &SearchFilter::default()).await;
    assert!(matches!(result, Err(RagError::Embedding(msg)) if msg == "provider unavailable"));
}

#[tokio::test]
async fn managed_hits_carry_their_metadata() {
    let chunk = &corpus().1[2];
    let retriever = canned(
        vec![SearchHit {
            target: HitTarget::Entry(Box::new(chunk.metadata())),
            score: 0.9,
        }],
        Duration::ZERO,
    );
    assert_eq!(retriever.mode(), StorageMode::Managed);

    let results = retriever
        .search("metformin", 5, &SearchFilter::default())
        .await
        .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rank, 1);
    assert_eq!(results[0].chunk, chunk.metadata());
}

#[tokio::test]
async fn dangling_position_is_a_data_error() {
    let retriever = canned(
        vec![SearchHit {
            target: HitTarget::Position(99),
            score: 0.5,
        }],
        Duration::ZERO,
    );
    let result = retriever.search("asthma", 5, &SearchFilter::default()).await;
    assert!(matches!(result, Err(RagError::DataIntegrity(_))));
}

#[tokio::test]
async fn slow_search_times_out() {
    let retriever = canned(Vec::new(), Duration::from_secs(5)).with_timeout(Duration::from_millis(50));
    let result = retriever.search("asthma", 5, &SearchFilter::default()).await;
    assert!(matches!(result, Err(RagError::Timeout(_))));
}
