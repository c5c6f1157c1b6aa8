// Embeddings module
// The provider trait the index and retriever consume, plus batching shared by every provider

pub mod azure_openai;


use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::{RagError, Result};

pub use azure_openai::AzureOpenAiClient;

/// How many texts go into one provider call and how long to pause between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub delay: Duration,
}

impl BatchPolicy {
    #[inline]
    pub fn from_config(embedding: &EmbeddingConfig) -> Self {
        Self {
            batch_size: embedding.batch_size,
            delay: embedding.batch_delay(),
        }
    }

    #[inline]
    pub const fn unthrottled(batch_size: usize) -> Self {
        Self {
            batch_size,
            delay: Duration::ZERO,
        }
    }
}

/// Source of fixed-length embedding vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed every text, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => Err(RagError::Embedding(
                "Provider returned an unexpected number of vectors for one text".to_string(),
            )),
        }
    }
}

/// Embed `texts` in groups of `policy.batch_size`, pausing `policy.delay`
/// between groups. Every returned vector is checked against
/// `provider.dimension()`.
#[inline]
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    policy: BatchPolicy,
) -> Result<Vec<Vec<f32>>> {
    let BatchPolicy { batch_size, delay } = policy;
    if batch_size == 0 {
        return Err(RagError::InvalidArgument(
            "Embedding batch size must be positive".to_string(),
        ));
    }

    let total_batches = texts.len().div_ceil(batch_size);
    let mut vectors = Vec::with_capacity(texts.len());

    for (i, batch) in texts.chunks(batch_size).enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!("Embedding batch {}/{} ({} texts)", i + 1, total_batches, batch.len());

        let batch_vectors = provider.embed_batch(batch).await?;
        if batch_vectors.len() != batch.len() {
            return Err(RagError::Embedding(format!(
                "Provider returned {} vectors for {} texts",
                batch_vectors.len(),
                batch.len()
            )));
        }
        for vector in &batch_vectors {
            check_dimension(provider.dimension(), vector)?;
        }
        vectors.extend(batch_vectors);
    }

    Ok(vectors)
}

#[inline]
pub fn check_dimension(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() == expected {
        Ok(())
    } else {
        Err(RagError::DimensionMismatch {
            expected,
            actual: vector.len(),
        })
    }
}
