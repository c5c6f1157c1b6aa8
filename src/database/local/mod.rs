
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::snapshot;
use super::{RecordStore, StoreStats};
use crate::Result;
use crate::models::{Chunk, Document};

pub const DOCUMENTS_FILE: &str = "documents.json";
pub const CHUNKS_FILE: &str = "chunks.json";

/// Documents and chunks kept as JSON arrays in one cache directory.
#[derive(Debug, Clone)]
pub struct LocalRecordStore {
    dir: PathBuf,
}

impl LocalRecordStore {
    #[inline]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn documents_path(&self) -> PathBuf {
        self.dir.join(DOCUMENTS_FILE)
    }

    fn chunks_path(&self) -> PathBuf {
        self.dir.join(CHUNKS_FILE)
    }
}

#[async_trait]
impl RecordStore for LocalRecordStore {
    async fn save_documents(&self, documents: &[Document]) -> Result<()> {
        snapshot::write_json(&self.documents_path(), documents).await?;
        info!(
            "Saved {} documents to {}",
            documents.len(),
            self.documents_path().display()
        );
        Ok(())
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        let documents: Vec<Document> = snapshot::read_json(&self.documents_path())
            .await?
            .unwrap_or_default();
        debug!("Loaded {} documents", documents.len());
        Ok(documents)
    }

    async fn save_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        snapshot::write_json(&self.chunks_path(), chunks).await?;
        info!(
            "Saved {} chunks to {}",
            chunks.len(),
            self.chunks_path().display()
        );
        Ok(())
    }

    async fn load_chunks(&self) -> Result<Vec<Chunk>> {
        let chunks: Vec<Chunk> = snapshot::read_json(&self.chunks_path())
            .await?
            .unwrap_or_default();
        debug!("Loaded {} chunks", chunks.len());
        Ok(chunks)
    }

    async fn get_document_by_id(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(self
            .load_documents()
            .await?
            .into_iter()
            .find(|d| d.doc_id == doc_id))
    }

    async fn get_chunks_by_doc_id(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = self
            .load_chunks()
            .await?
            .into_iter()
            .filter(|c| c.doc_id == doc_id)
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            document_count: self.load_documents().await?.len(),
            chunk_count: self.load_chunks().await?.len(),
            location: self.dir.display().to_string(),
        })
    }

    async fn purge(&self) -> Result<()> {
        let documents = snapshot::remove_if_exists(&self.documents_path()).await?;
        let chunks = snapshot::remove_if_exists(&self.chunks_path()).await?;
        info!(
            "Purged local records (documents file removed: {}, chunks file removed: {})",
            documents, chunks
        );
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}
