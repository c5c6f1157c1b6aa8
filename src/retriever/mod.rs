// Retriever module
// Embeds a query, searches the configured index and resolves ranked results

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StorageMode;
use crate::embeddings::EmbeddingProvider;
use crate::index::{HitTarget, SearchFilter, SearchHit, VectorIndexBackend};
use crate::models::{ChunkMetadata, RetrievalResult};
use crate::{RagError, Result};

/// Query front end over one index backend, fixed at construction.
pub struct Retriever {
    mode: StorageMode,
    index: Arc<dyn VectorIndexBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Retriever {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("mode", &self.mode)
            .field("dimension", &self.index.dimension())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Retriever {
    #[inline]
    pub fn new(
        mode: StorageMode,
        index: Arc<dyn VectorIndexBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            mode,
            index,
            embedder,
            timeout: None,
        }
    }

    /// Bound the query embedding and the index search together.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Up to `top_k` results for `query`, best first, ranked from 1.
    ///
    /// Embedding failures propagate unchanged and are not retried here.
    #[inline]
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<RetrievalResult>> {
        if top_k == 0 {
            return Err(RagError::InvalidArgument(
                "top_k must be at least 1".to_string(),
            ));
        }

        let hits = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.embed_and_search(query, top_k, filter))
                .await
                .map_err(|_| {
                    RagError::Timeout(format!("Search did not finish within {limit:?}"))
                })??,
            None => self.embed_and_search(query, top_k, filter).await?,
        };

        let mut results = Vec::with_capacity(hits.len());
        for (i, hit) in hits.into_iter().enumerate() {
            results.push(RetrievalResult {
                rank: i + 1,
                similarity_score: hit.score,
                chunk: self.resolve(hit.target).await?,
            });
        }

        info!(
            "{} search returned {} results for {:?}",
            self.mode,
            results.len(),
            query
        );
        Ok(results)
    }

    async fn embed_and_search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        let embedding = self.embedder.embed_one(query).await?;
        debug!("Embedded query into {} dimensions", embedding.len());
        let mut hits = self.index.search(&embedding, top_k, filter).await?;
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn resolve(&self, target: HitTarget) -> Result<ChunkMetadata> {
        match target {
            HitTarget::Entry(metadata) => Ok(*metadata),
            HitTarget::Position(position) => {
                self.index.metadata_at(position).await?.ok_or_else(|| {
                    RagError::DataIntegrity(format!(
                        "Index hit at position {position} has no metadata entry"
                    ))
                })
            }
        }
    }
}
