
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::{RagError, Result};

/// One ingested source page or file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub source_org: String,
    #[serde(default)]
    pub pub_date: String,
}

/// A retrievable segment of a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub doc_title: String,
    pub raw_chunk: String,
    pub chunk_index: u32,
    pub ctx_header: String,
    /// `ctx_header` followed by `raw_chunk`; the text that gets embedded.
    pub augmented_chunk: String,
    #[serde(default)]
    pub section_path: String,
    #[serde(default)]
    pub source_org: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub pub_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Display fields of a chunk, kept next to its vector in the index.
///
/// Search services return `null` for unset fields; those read as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_id: String,
    pub doc_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub doc_title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub raw_chunk: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ctx_header: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub augmented_chunk: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub section_path: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub source_org: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub source_url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub pub_date: String,
    pub chunk_index: u32,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One ranked answer to a query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub rank: usize,
    pub similarity_score: f32,
    #[serde(flatten)]
    pub chunk: ChunkMetadata,
}

impl Chunk {
    /// Build a chunk from its owning document, filling the augmented text
    /// and the denormalized document fields.
    #[inline]
    pub fn new(
        document: &Document,
        chunk_index: u32,
        section_path: impl Into<String>,
        ctx_header: impl Into<String>,
        raw_chunk: impl Into<String>,
    ) -> Self {
        let ctx_header = ctx_header.into();
        let raw_chunk = raw_chunk.into();
        Self {
            chunk_id: format!("{}-{chunk_index:04}", document.doc_id),
            doc_id: document.doc_id.clone(),
            doc_title: document.title.clone(),
            augmented_chunk: format!("{ctx_header}{raw_chunk}"),
            raw_chunk,
            chunk_index,
            ctx_header,
            section_path: section_path.into(),
            source_org: document.source_org.clone(),
            source_url: document.source_url.clone(),
            pub_date: document.pub_date.clone(),
            embedding: None,
        }
    }

    #[inline]
    pub fn has_consistent_augmented_text(&self) -> bool {
        self.augmented_chunk.len() == self.ctx_header.len() + self.raw_chunk.len()
            && self.augmented_chunk.starts_with(&self.ctx_header)
            && self.augmented_chunk.ends_with(&self.raw_chunk)
    }

    #[inline]
    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            chunk_id: self.chunk_id.clone(),
            doc_id: self.doc_id.clone(),
            doc_title: self.doc_title.clone(),
            raw_chunk: self.raw_chunk.clone(),
            ctx_header: self.ctx_header.clone(),
            augmented_chunk: self.augmented_chunk.clone(),
            section_path: self.section_path.clone(),
            source_org: self.source_org.clone(),
            source_url: self.source_url.clone(),
            pub_date: self.pub_date.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

/// Check the corpus invariants: every chunk belongs to a known document,
/// chunk indices are unique per document and every augmented text is the
/// exact concatenation of header and raw text.
#[inline]
pub fn validate_corpus(documents: &[Document], chunks: &[Chunk]) -> Result<()> {
    let doc_ids: HashSet<&str> = documents.iter().map(|d| d.doc_id.as_str()).collect();
    let mut seen: HashMap<&str, HashSet<u32>> = HashMap::new();
    let mut chunk_ids: HashSet<&str> = HashSet::with_capacity(chunks.len());

    for chunk in chunks {
        if !chunk_ids.insert(chunk.chunk_id.as_str()) {
            return Err(RagError::DataIntegrity(format!(
                "Duplicate chunk id {}",
                chunk.chunk_id
            )));
        }
        if !doc_ids.contains(chunk.doc_id.as_str()) {
            return Err(RagError::DataIntegrity(format!(
                "Chunk {} references unknown document {}",
                chunk.chunk_id, chunk.doc_id
            )));
        }
        if !seen
            .entry(chunk.doc_id.as_str())
            .or_default()
            .insert(chunk.chunk_index)
        {
            return Err(RagError::DataIntegrity(format!(
                "Chunk {} repeats index {} within document {}",
                chunk.chunk_id, chunk.chunk_index, chunk.doc_id
            )));
        }
        if !chunk.has_consistent_augmented_text() {
            return Err(RagError::DataIntegrity(format!(
                "Chunk {} augmented text is not header + raw text",
                chunk.chunk_id
            )));
        }
    }

    Ok(())
}
