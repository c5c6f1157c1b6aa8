
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::flat::{FlatIndex, decode_embeddings, encode_embeddings};
use super::{
    BuildOrigin, BuildRequest, HitTarget, IndexBuild, SearchFilter, SearchHit, VectorIndexBackend,
};
use crate::database::snapshot;
use crate::embeddings::{BatchPolicy, EmbeddingProvider, embed_in_batches};
use crate::models::ChunkMetadata;
use crate::{RagError, Result};

pub const INDEX_FILE: &str = "index.bin";
pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug)]
struct LoadedIndex {
    index: FlatIndex,
    metadata: Vec<ChunkMetadata>,
}

/// Exact index persisted as three files in the cache directory.
///
/// The first read loads the files into memory; later reads share the cached
/// copy until a rebuild or delete replaces it.
#[derive(Debug)]
pub struct LocalVectorIndex {
    dir: PathBuf,
    dimension: usize,
    policy: BatchPolicy,
    loaded: RwLock<Option<Arc<LoadedIndex>>>,
}

impl LocalVectorIndex {
    #[inline]
    pub fn new(dir: impl Into<PathBuf>, dimension: usize, policy: BatchPolicy) -> Self {
        Self {
            dir: dir.into(),
            dimension,
            policy,
            loaded: RwLock::new(None),
        }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Read the persisted index, or `None` when no index file exists.
    async fn read_persisted(&self) -> Result<Option<LoadedIndex>> {
        let Some(bytes) = snapshot::read_if_exists(&self.path(INDEX_FILE)).await? else {
            return Ok(None);
        };
        let index = FlatIndex::from_bytes(&bytes)?;
        if index.dimension() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: index.dimension(),
            });
        }

        let metadata: Vec<ChunkMetadata> = snapshot::read_json(&self.path(METADATA_FILE))
            .await?
            .ok_or_else(|| {
                RagError::DataIntegrity(format!(
                    "{} exists without {}",
                    INDEX_FILE, METADATA_FILE
                ))
            })?;
        if metadata.len() != index.len() {
            return Err(RagError::DataIntegrity(format!(
                "Index holds {} vectors but metadata has {} entries",
                index.len(),
                metadata.len()
            )));
        }

        debug!("Loaded index with {} vectors from {}", index.len(), self.dir.display());
        Ok(Some(LoadedIndex { index, metadata }))
    }

    /// Cached index, reading it from disk on first use.
    async fn current(&self) -> Result<Option<Arc<LoadedIndex>>> {
        let cached = self.loaded.read().await.clone();
        if cached.is_some() {
            return Ok(cached);
        }

        let mut slot = self.loaded.write().await;
        if slot.is_none() {
            *slot = self.read_persisted().await?.map(Arc::new);
        }
        Ok(slot.clone())
    }

    async fn read_embeddings(&self) -> Result<Vec<Vec<f32>>> {
        let bytes = snapshot::read_if_exists(&self.path(EMBEDDINGS_FILE))
            .await?
            .ok_or_else(|| {
                RagError::DataIntegrity(format!(
                    "{} exists without {}",
                    INDEX_FILE, EMBEDDINGS_FILE
                ))
            })?;
        decode_embeddings(&bytes)
    }

    async fn persist(
        &self,
        index: &FlatIndex,
        embeddings: &[Vec<f32>],
        metadata: &[ChunkMetadata],
    ) -> Result<()> {
        // Without an index file the other two are never trusted, so an
        // interrupted rewrite leaves a directory that rebuilds.
        snapshot::remove_if_exists(&self.path(INDEX_FILE)).await?;
        snapshot::write_json(&self.path(METADATA_FILE), metadata).await?;
        snapshot::write_atomic(
            &self.path(EMBEDDINGS_FILE),
            &encode_embeddings(self.dimension, embeddings)?,
        )
        .await?;
        // Written last: an index file means the other two are complete.
        snapshot::write_atomic(&self.path(INDEX_FILE), &index.to_bytes()).await
    }
}

#[async_trait]
impl VectorIndexBackend for LocalVectorIndex {
    async fn build_or_load_index(
        &self,
        request: BuildRequest,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<IndexBuild> {
        request.validate(self.dimension)?;

        if request.force {
            info!("Forced rebuild of the local index");
        } else {
            match self.current().await {
                Ok(Some(existing)) if existing.index.len() == request.texts.len() => {
                    info!(
                        "Loaded existing local index with {} vectors",
                        existing.index.len()
                    );
                    return Ok(IndexBuild {
                        metadata: existing.metadata.clone(),
                        embeddings: self.read_embeddings().await?,
                        origin: BuildOrigin::Loaded,
                    });
                }
                Ok(Some(existing)) => warn!(
                    "Local index holds {} vectors but {} texts were given, rebuilding",
                    existing.index.len(),
                    request.texts.len()
                ),
                Ok(None) => {}
                Err(RagError::DataIntegrity(reason)) => {
                    warn!("Local index files disagree ({}), rebuilding", reason);
                }
                Err(e) => return Err(e),
            }
        }

        let BuildRequest {
            texts,
            metadata,
            embeddings,
            ..
        } = request;
        let embeddings = match embeddings {
            Some(embeddings) => {
                debug!("Using {} precomputed embeddings", embeddings.len());
                embeddings
            }
            None => {
                info!("Embedding {} texts", texts.len());
                embed_in_batches(embedder, &texts, self.policy).await?
            }
        };

        let index = FlatIndex::from_embeddings(self.dimension, &embeddings)?;
        self.persist(&index, &embeddings, &metadata).await?;
        info!(
            "Built local index with {} vectors in {}",
            index.len(),
            self.dir.display()
        );

        *self.loaded.write().await = Some(Arc::new(LoadedIndex {
            index,
            metadata: metadata.clone(),
        }));

        Ok(IndexBuild {
            metadata,
            embeddings,
            origin: BuildOrigin::Built,
        })
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        let Some(loaded) = self.current().await? else {
            debug!("No local index, returning no hits");
            return Ok(Vec::new());
        };

        let keep = |position: usize| {
            filter.is_empty()
                || loaded
                    .metadata
                    .get(position)
                    .is_some_and(|m| filter.matches(m))
        };
        let hits = loaded.index.search(query_embedding, top_k, keep)?;

        Ok(hits
            .into_iter()
            .map(|(position, score)| SearchHit {
                target: HitTarget::Position(position),
                score,
            })
            .collect())
    }

    async fn metadata_at(&self, position: usize) -> Result<Option<ChunkMetadata>> {
        Ok(self
            .current()
            .await?
            .and_then(|loaded| loaded.metadata.get(position).cloned()))
    }

    async fn get_document_count(&self) -> Result<usize> {
        Ok(self
            .current()
            .await?
            .map_or(0, |loaded| loaded.index.len()))
    }

    async fn delete_index(&self) -> Result<()> {
        let mut slot = self.loaded.write().await;
        let mut removed = false;
        for file in [INDEX_FILE, EMBEDDINGS_FILE, METADATA_FILE] {
            removed |= snapshot::remove_if_exists(&self.path(file)).await?;
        }
        *slot = None;
        drop(slot);

        if removed {
            info!("Deleted local index in {}", self.dir.display());
        } else {
            debug!("No local index to delete in {}", self.dir.display());
        }
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
