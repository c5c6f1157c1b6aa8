// Database module
// Whole-collection persistence of documents and chunks, in local JSON snapshots or Cosmos DB

pub mod cosmos;
pub mod local;
pub mod snapshot;

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;
use crate::models::{Chunk, Document};

pub use cosmos::CosmosRecordStore;
pub use local::LocalRecordStore;

/// Record counts reported by a store; empty collections count as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub chunk_count: usize,
    /// Directory or database the counts were read from.
    pub location: String,
}

/// Persistence for the document and chunk collections.
///
/// Saves replace the whole collection. Loading a collection that was never
/// written yields an empty list, not an error.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_documents(&self, documents: &[Document]) -> Result<()>;

    async fn load_documents(&self) -> Result<Vec<Document>>;

    async fn save_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    async fn load_chunks(&self) -> Result<Vec<Chunk>>;

    async fn get_document_by_id(&self, doc_id: &str) -> Result<Option<Document>>;

    /// Chunks of one document ordered by `chunk_index`.
    async fn get_chunks_by_doc_id(&self, doc_id: &str) -> Result<Vec<Chunk>>;

    async fn get_stats(&self) -> Result<StoreStats>;

    /// Delete every document and chunk.
    async fn purge(&self) -> Result<()>;

    /// Create whatever containers the backend needs before the first save.
    async fn initialize(&self) -> Result<()>;
}
