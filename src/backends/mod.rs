// Backend selection
// Builds the record store and vector index pair for the configured storage mode


use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{Config, StorageMode};
use crate::database::{CosmosRecordStore, LocalRecordStore, RecordStore};
use crate::embeddings::{BatchPolicy, EmbeddingProvider};
use crate::index::{AzureSearchIndex, BuildRequest, IndexBuild, LocalVectorIndex, VectorIndexBackend};
use crate::models::{Chunk, Document, validate_corpus};
use crate::Result;
use crate::retriever::Retriever;

/// One record store and one vector index, both for the same storage mode.
#[derive(Clone)]
pub struct Backends {
    pub mode: StorageMode,
    pub records: Arc<dyn RecordStore>,
    pub index: Arc<dyn VectorIndexBackend>,
}

impl std::fmt::Debug for Backends {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("mode", &self.mode)
            .field("dimension", &self.index.dimension())
            .finish_non_exhaustive()
    }
}

/// Counts reported after copying local data into the managed services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub documents: usize,
    pub chunks: usize,
    /// Chunks whose stored embedding was carried over instead of recomputed.
    pub reused_embeddings: usize,
    pub indexed: usize,
}

impl Backends {
    /// Backends for `config.storage_mode`. Managed mode resolves every
    /// required setting first and fails naming the missing one, before any
    /// network call.
    #[inline]
    pub fn open(config: &Config) -> Result<Self> {
        match config.storage_mode {
            StorageMode::Local => Ok(Self::local(config)),
            StorageMode::Managed => Self::managed(config),
        }
    }

    #[inline]
    pub fn local(config: &Config) -> Self {
        let dir = config.cache_dir();
        debug!("Using local backends in {}", dir.display());
        Self {
            mode: StorageMode::Local,
            records: Arc::new(LocalRecordStore::new(dir.clone())),
            index: Arc::new(LocalVectorIndex::new(
                dir,
                config.embedding.dimension,
                BatchPolicy::from_config(&config.embedding),
            )),
        }
    }

    #[inline]
    pub fn managed(config: &Config) -> Result<Self> {
        let credentials = config.managed_credentials()?;
        debug!(
            "Using Cosmos DB database {} and search index {}",
            credentials.cosmos.database, credentials.search.index_name
        );
        Ok(Self {
            mode: StorageMode::Managed,
            records: Arc::new(CosmosRecordStore::new(config.cosmos.clone(), &config.http)),
            index: Arc::new(AzureSearchIndex::new(
                config.search.clone(),
                config.embedding.dimension,
                BatchPolicy::from_config(&config.embedding),
                &config.http,
            )),
        })
    }

    #[inline]
    pub fn retriever(&self, embedder: Arc<dyn EmbeddingProvider>) -> Retriever {
        Retriever::new(self.mode, Arc::clone(&self.index), embedder)
    }

    /// Validate the corpus and replace both stored collections with it.
    #[inline]
    pub async fn ingest(&self, documents: &[Document], chunks: &[Chunk]) -> Result<()> {
        validate_corpus(documents, chunks)?;
        self.records.initialize().await?;
        self.records.save_documents(documents).await?;
        self.records.save_chunks(chunks).await?;
        info!(
            "Ingested {} documents and {} chunks into {} storage",
            documents.len(),
            chunks.len(),
            self.mode
        );
        Ok(())
    }

    /// Build or reuse the index over every stored chunk.
    #[inline]
    pub async fn build_index(
        &self,
        embedder: &dyn EmbeddingProvider,
        force: bool,
    ) -> Result<IndexBuild> {
        let chunks = self.records.load_chunks().await?;
        self.index
            .build_or_load_index(BuildRequest::from_chunks(chunks, force), embedder)
            .await
    }
}

/// Copy the records of `source` into `target` and build the target index,
/// reusing the vectors of the source index so nothing is embedded twice.
#[inline]
pub async fn migrate(
    source: &Backends,
    target: &Backends,
    embedder: &dyn EmbeddingProvider,
    force: bool,
) -> Result<MigrationReport> {
    let documents = source.records.load_documents().await?;
    let mut chunks = source.records.load_chunks().await?;
    info!(
        "Migrating {} documents and {} chunks from {} to {} storage",
        documents.len(),
        chunks.len(),
        source.mode,
        target.mode
    );

    let source_build = source
        .index
        .build_or_load_index(BuildRequest::from_chunks(chunks.clone(), false), embedder)
        .await?;
    let reused_embeddings = attach_embeddings(&mut chunks, source_build);

    let chunk_count = chunks.len();
    target.ingest(&documents, &chunks).await?;
    target
        .index
        .build_or_load_index(BuildRequest::from_chunks(chunks, force), embedder)
        .await?;
    let indexed = target.index.get_document_count().await?;

    let report = MigrationReport {
        documents: documents.len(),
        chunks: chunk_count,
        reused_embeddings,
        indexed,
    };
    info!("Migration finished: {:?}", report);
    Ok(report)
}

/// Store each vector of `build` on the chunk with the same id. Returns how
/// many chunks received one.
fn attach_embeddings(chunks: &mut [Chunk], build: IndexBuild) -> usize {
    let by_id: HashMap<String, Vec<f32>> = build
        .metadata
        .into_iter()
        .map(|m| m.chunk_id)
        .zip(build.embeddings)
        .collect();

    let mut attached = 0;
    for chunk in chunks.iter_mut() {
        if let Some(vector) = by_id.get(&chunk.chunk_id) {
            chunk.embedding = Some(vector.clone());
            attached += 1;
        }
    }
    attached
}
