// Vector index module
// Similarity search over chunk embeddings: an exact in-process index persisted to
// files, or an Azure AI Search index reached over REST

pub mod azure;
pub mod flat;
pub mod local;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embeddings::{EmbeddingProvider, check_dimension};
use crate::models::{Chunk, ChunkMetadata};
use crate::{RagError, Result};

pub use azure::AzureSearchIndex;
pub use flat::FlatIndex;
pub use local::LocalVectorIndex;

/// Inputs for [`VectorIndexBackend::build_or_load_index`].
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Texts to embed when `embeddings` is absent, one per metadata entry.
    pub texts: Vec<String>,
    pub metadata: Vec<ChunkMetadata>,
    /// Precomputed vectors aligned with `texts`.
    pub embeddings: Option<Vec<Vec<f32>>>,
    /// Full chunk records; required by the managed backend.
    pub chunks: Option<Vec<Chunk>>,
    pub force: bool,
}

impl BuildRequest {
    /// Request covering `chunks`, embedding their augmented text. Stored
    /// vectors are reused only when every chunk carries one.
    #[inline]
    pub fn from_chunks(chunks: Vec<Chunk>, force: bool) -> Self {
        let texts = chunks.iter().map(|c| c.augmented_chunk.clone()).collect();
        let metadata = chunks.iter().map(Chunk::metadata).collect();
        let embeddings = chunks
            .iter()
            .map(|c| c.embedding.clone())
            .collect::<Option<Vec<_>>>()
            .filter(|v| !v.is_empty());
        Self {
            texts,
            metadata,
            embeddings,
            chunks: Some(chunks),
            force,
        }
    }

    /// Check that every aligned input has the same length and that supplied
    /// vectors match `dimension`.
    #[inline]
    pub fn validate(&self, dimension: usize) -> Result<()> {
        let expected = self.texts.len();
        if self.metadata.len() != expected {
            return Err(RagError::InvalidArgument(format!(
                "{} texts but {} metadata entries",
                expected,
                self.metadata.len()
            )));
        }
        if let Some(embeddings) = &self.embeddings {
            if embeddings.len() != expected {
                return Err(RagError::InvalidArgument(format!(
                    "{} texts but {} embeddings",
                    expected,
                    embeddings.len()
                )));
            }
            for vector in embeddings {
                check_dimension(dimension, vector)?;
            }
        }
        if let Some(chunks) = &self.chunks {
            if chunks.len() != expected {
                return Err(RagError::InvalidArgument(format!(
                    "{} texts but {} chunks",
                    expected,
                    chunks.len()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildOrigin {
    /// An existing index was reused; nothing was embedded or uploaded.
    Loaded,
    Built,
}

#[derive(Debug, Clone)]
pub struct IndexBuild {
    pub metadata: Vec<ChunkMetadata>,
    pub embeddings: Vec<Vec<f32>>,
    pub origin: BuildOrigin,
}

/// Where the display fields of a hit come from.
#[derive(Debug, Clone, PartialEq)]
pub enum HitTarget {
    /// Position in the local metadata array.
    Position(usize),
    /// Fields returned by the managed service with the hit.
    Entry(Box<ChunkMetadata>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub target: HitTarget,
    /// Cosine similarity, higher is closer.
    pub score: f32,
}

/// Equality and date-range constraints over chunk metadata.
///
/// Dates compare as strings, so ISO `YYYY-MM-DD` values order correctly.
/// Both bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub doc_id: Option<String>,
    pub source_org: Option<String>,
    pub section_path: Option<String>,
    pub published_after: Option<String>,
    pub published_before: Option<String>,
}

impl SearchFilter {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    #[inline]
    pub fn with_doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    #[inline]
    pub fn with_source_org(mut self, source_org: impl Into<String>) -> Self {
        self.source_org = Some(source_org.into());
        self
    }

    #[inline]
    pub fn with_section_path(mut self, section_path: impl Into<String>) -> Self {
        self.section_path = Some(section_path.into());
        self
    }

    #[inline]
    pub fn published_between(mut self, after: Option<String>, before: Option<String>) -> Self {
        self.published_after = after;
        self.published_before = before;
        self
    }

    #[inline]
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        let equals = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);
        equals(&self.doc_id, &metadata.doc_id)
            && equals(&self.source_org, &metadata.source_org)
            && equals(&self.section_path, &metadata.section_path)
            && self
                .published_after
                .as_deref()
                .is_none_or(|after| metadata.pub_date.as_str() >= after)
            && self
                .published_before
                .as_deref()
                .is_none_or(|before| metadata.pub_date.as_str() <= before)
    }

    /// OData `$filter` expression, or `None` when nothing is constrained.
    #[inline]
    pub fn to_odata(&self) -> Option<String> {
        let mut clauses = Vec::new();
        for (field, value) in [
            ("doc_id", &self.doc_id),
            ("source_org", &self.source_org),
            ("section_path", &self.section_path),
        ] {
            if let Some(v) = value {
                clauses.push(format!("{field} eq {}", odata_literal(v)));
            }
        }
        if let Some(after) = &self.published_after {
            clauses.push(format!("pub_date ge {}", odata_literal(after)));
        }
        if let Some(before) = &self.published_before {
            clauses.push(format!("pub_date le {}", odata_literal(before)));
        }
        (!clauses.is_empty()).then(|| clauses.join(" and "))
    }
}

fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Nearest-neighbour search over chunk embeddings.
#[async_trait]
pub trait VectorIndexBackend: Send + Sync {
    /// Reuse the persisted index when it exists, `force` is false and it
    /// holds one entry per requested text; otherwise embed (unless vectors
    /// are supplied), rebuild and persist.
    async fn build_or_load_index(
        &self,
        request: BuildRequest,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<IndexBuild>;

    /// At most `top_k` hits by descending cosine similarity; equal scores
    /// keep insertion order. No index yields no hits.
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>>;

    /// Metadata for a [`HitTarget::Position`].
    async fn metadata_at(&self, position: usize) -> Result<Option<ChunkMetadata>>;

    async fn get_document_count(&self) -> Result<usize>;

    /// Remove the persisted index; a missing index is not an error.
    async fn delete_index(&self) -> Result<()>;

    fn dimension(&self) -> usize;
}
