
use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    BuildOrigin, BuildRequest, HitTarget, IndexBuild, SearchFilter, SearchHit, VectorIndexBackend,
};
use crate::config::{HttpConfig, SearchConfig, SearchCredentials};
use crate::embeddings::{BatchPolicy, EmbeddingProvider, check_dimension, embed_in_batches};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::models::{Chunk, ChunkMetadata};
use crate::{RagError, Result};

const SERVICE: &str = "Azure AI Search";
const VECTOR_FIELD: &str = "embedding";
const VECTOR_PROFILE: &str = "medical-context-vector-profile";
const HNSW_CONFIG: &str = "medical-context-hnsw";
const SEMANTIC_CONFIG: &str = "medical-context-semantic";
/// Upload statuses worth waiting out; the service sheds indexing load with 503.
const UPLOAD_RETRY_STATUSES: &[u16] = &[429, 503];
const SELECT_FIELDS: &str = "chunk_id,doc_id,doc_title,raw_chunk,ctx_header,augmented_chunk,section_path,source_org,source_url,pub_date,chunk_index";

/// Vector index hosted in Azure AI Search, reached over its REST API.
///
/// Settings are checked on every call, so an index built from incomplete
/// configuration fails before any request is sent.
#[derive(Debug, Clone)]
pub struct AzureSearchIndex {
    settings: SearchConfig,
    dimension: usize,
    policy: BatchPolicy,
    http: HttpClient,
}

#[derive(Debug, Serialize)]
struct UploadBatch<'a> {
    value: Vec<IndexDocument<'a>>,
}

#[derive(Debug, Serialize)]
struct IndexDocument<'a> {
    #[serde(rename = "@search.action")]
    action: &'static str,
    id: String,
    chunk_id: &'a str,
    doc_id: &'a str,
    doc_title: &'a str,
    raw_chunk: &'a str,
    ctx_header: &'a str,
    augmented_chunk: &'a str,
    section_path: &'a str,
    source_org: &'a str,
    source_url: &'a str,
    pub_date: &'a str,
    chunk_index: u32,
    embedding: &'a [f32],
}

#[derive(Debug, Deserialize)]
struct IndexingResults {
    value: Vec<IndexingResult>,
}

#[derive(Debug, Deserialize)]
struct IndexingResult {
    key: String,
    status: bool,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    value: Vec<ScoredDocument>,
}

#[derive(Debug, Deserialize)]
struct ScoredDocument {
    #[serde(rename = "@search.score")]
    score: f32,
    #[serde(flatten)]
    metadata: ChunkMetadata,
}

#[derive(Debug, Deserialize)]
struct IndexDefinition {
    #[serde(default)]
    fields: Vec<FieldDefinition>,
}

#[derive(Debug, Deserialize)]
struct FieldDefinition {
    name: String,
    dimensions: Option<usize>,
}

impl AzureSearchIndex {
    #[inline]
    pub fn new(
        settings: SearchConfig,
        dimension: usize,
        policy: BatchPolicy,
        http: &HttpConfig,
    ) -> Self {
        Self::with_timeout(
            settings,
            dimension,
            policy,
            Duration::from_secs(http.timeout_seconds),
        )
    }

    #[inline]
    pub fn with_timeout(
        settings: SearchConfig,
        dimension: usize,
        policy: BatchPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            settings,
            dimension,
            policy,
            http: HttpClient::new(SERVICE, timeout),
        }
    }

    fn credentials(&self) -> Result<SearchCredentials> {
        Ok(self.settings.credentials()?)
    }

    fn request(
        credentials: &SearchCredentials,
        method: Method,
        path: &[&str],
    ) -> Result<HttpRequest> {
        let mut url = service_url(&credentials.endpoint, path)?;
        url.query_pairs_mut()
            .append_pair("api-version", &credentials.api_version);
        Ok(HttpRequest::new(method, url.as_str())
            .header("api-key", credentials.key.as_str())
            .header("Accept", "application/json"))
    }

    fn index_path(credentials: &SearchCredentials) -> [&str; 2] {
        ["indexes", credentials.index_name.as_str()]
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.http.send_throttled(request, &[429]).await
    }

    /// Current index definition, or `None` when the index does not exist.
    async fn fetch_definition(
        &self,
        credentials: &SearchCredentials,
    ) -> Result<Option<IndexDefinition>> {
        let request = Self::request(credentials, Method::Get, &Self::index_path(credentials))?;
        let response = self.send(request).await?;
        match response.status {
            404 => Ok(None),
            200..=299 => response
                .json(&format!("definition of index {}", credentials.index_name))
                .map(Some),
            _ => Err(response.into_error(SERVICE)),
        }
    }

    fn check_definition(&self, definition: &IndexDefinition) -> Result<()> {
        let dimensions = definition
            .fields
            .iter()
            .find(|f| f.name == VECTOR_FIELD)
            .and_then(|f| f.dimensions);
        match dimensions {
            Some(actual) if actual != self.dimension => Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual,
            }),
            Some(_) => Ok(()),
            None => Err(RagError::DataIntegrity(format!(
                "Index has no vector field named {VECTOR_FIELD}"
            ))),
        }
    }

    async fn count(&self, credentials: &SearchCredentials) -> Result<usize> {
        let request = Self::request(
            credentials,
            Method::Get,
            &["indexes", credentials.index_name.as_str(), "docs", "$count"],
        )?;
        let response = self.send(request).await?;
        match response.status {
            404 => Ok(0),
            200..=299 => {
                let text = response.body.trim().trim_start_matches('\u{feff}');
                text.parse().map_err(|_| {
                    RagError::DataIntegrity(format!("Malformed document count: {text:?}"))
                })
            }
            _ => Err(response.into_error(SERVICE)),
        }
    }

    async fn delete(&self, credentials: &SearchCredentials) -> Result<bool> {
        let request =
            Self::request(credentials, Method::Delete, &Self::index_path(credentials))?;
        let response = self.send(request).await?;
        match response.status {
            200..=299 => Ok(true),
            404 => Ok(false),
            _ => {
                error!("Failed to delete index {}: HTTP {}", credentials.index_name, response.status);
                Err(response.into_error(SERVICE))
            }
        }
    }

    async fn create(&self, credentials: &SearchCredentials) -> Result<()> {
        let request = Self::request(credentials, Method::Put, &Self::index_path(credentials))?
            .json(&index_definition(&credentials.index_name, self.dimension))?;
        let response = self.send(request).await?;
        if response.is_success() {
            info!("Created index {}", credentials.index_name);
            Ok(())
        } else {
            error!("Failed to create index {}: HTTP {}", credentials.index_name, response.status);
            Err(response.into_error(SERVICE))
        }
    }

    async fn upload(
        &self,
        credentials: &SearchCredentials,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        let batch_size = self.settings.upload_batch_size.max(1);
        let total_batches = chunks.len().div_ceil(batch_size);

        for (i, (chunk_batch, vector_batch)) in chunks
            .chunks(batch_size)
            .zip(embeddings.chunks(batch_size))
            .enumerate()
        {
            let batch = UploadBatch {
                value: chunk_batch
                    .iter()
                    .zip(vector_batch)
                    .map(|(chunk, vector)| index_document(chunk, vector))
                    .collect(),
            };
            let request = Self::request(
                credentials,
                Method::Post,
                &["indexes", credentials.index_name.as_str(), "docs", "index"],
            )?
            .json(&batch)?;

            let response = self
                .http
                .send_throttled(request, UPLOAD_RETRY_STATUSES)
                .await?;
            // 207 carries per-document failures in the body.
            if !response.is_success() && response.status != 207 {
                error!("Upload batch {}/{} failed: HTTP {}", i + 1, total_batches, response.status);
                return Err(response.into_error(SERVICE));
            }
            let results: IndexingResults = response.json("indexing results")?;
            let failed: Vec<&IndexingResult> = results.value.iter().filter(|r| !r.status).collect();
            if let Some(first) = failed.first() {
                for result in &failed {
                    error!(
                        "Failed to upload {}: {}",
                        result.key,
                        result.error_message.as_deref().unwrap_or("no message")
                    );
                }
                return Err(RagError::DataIntegrity(format!(
                    "{} of {} documents rejected in upload batch {}, first {}",
                    failed.len(),
                    chunk_batch.len(),
                    i + 1,
                    first.key
                )));
            }
            info!("Uploaded batch {}/{} ({} documents)", i + 1, total_batches, chunk_batch.len());
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndexBackend for AzureSearchIndex {
    async fn build_or_load_index(
        &self,
        request: BuildRequest,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<IndexBuild> {
        let credentials = self.credentials()?;
        request.validate(self.dimension)?;
        if request.chunks.is_none() {
            return Err(RagError::InvalidArgument(
                "Building the managed index requires chunk records".to_string(),
            ));
        }

        let existing = self.fetch_definition(&credentials).await?;
        if let Some(definition) = &existing {
            if !request.force {
                self.check_definition(definition)?;
                let count = self.count(&credentials).await?;
                if count == request.texts.len() {
                    info!("Reusing index {} with {} documents", credentials.index_name, count);
                    return Ok(IndexBuild {
                        metadata: request.metadata,
                        embeddings: request.embeddings.unwrap_or_default(),
                        origin: BuildOrigin::Loaded,
                    });
                }
                warn!(
                    "Index {} holds {} documents but {} texts were given, rebuilding",
                    credentials.index_name,
                    count,
                    request.texts.len()
                );
            }
        }

        let BuildRequest {
            texts,
            metadata,
            embeddings,
            chunks,
            ..
        } = request;
        let chunks = chunks.unwrap_or_default();
        let embeddings = match embeddings {
            Some(embeddings) => embeddings,
            None => {
                info!("Embedding {} texts", texts.len());
                embed_in_batches(embedder, &texts, self.policy).await?
            }
        };

        if existing.is_some() {
            self.delete(&credentials).await?;
        }
        self.create(&credentials).await?;
        self.upload(&credentials, &chunks, &embeddings).await?;
        info!(
            "Built index {} with {} documents",
            credentials.index_name,
            chunks.len()
        );

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
        let credentials = self.credentials()?;
        check_dimension(self.dimension, query_embedding)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let body = search_body(query_embedding, top_k, filter);
        let request = Self::request(
            &credentials,
            Method::Post,
            &["indexes", credentials.index_name.as_str(), "docs", "search"],
        )?
        .json(&body)?;

        let response = self.send(request).await?;
        if response.status == 404 {
            debug!("Index {} does not exist, returning no hits", credentials.index_name);
            return Ok(Vec::new());
        }
        if !response.is_success() {
            error!("Search on {} failed: HTTP {}", credentials.index_name, response.status);
            return Err(response.into_error(SERVICE));
        }

        let mut results: SearchResponse = response.json("search results")?;
        results.value.truncate(top_k);
        debug!("{} hits from {}", results.value.len(), credentials.index_name);

        let mut hits: Vec<SearchHit> = results
            .value
            .into_iter()
            .map(|doc| SearchHit {
                score: score_to_cosine(doc.score),
                target: HitTarget::Entry(Box::new(doc.metadata)),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits)
    }

    async fn metadata_at(&self, _position: usize) -> Result<Option<ChunkMetadata>> {
        Ok(None)
    }

    async fn get_document_count(&self) -> Result<usize> {
        let credentials = self.credentials()?;
        self.count(&credentials).await
    }

    async fn delete_index(&self) -> Result<()> {
        let credentials = self.credentials()?;
        if self.delete(&credentials).await? {
            info!("Deleted index {}", credentials.index_name);
        } else {
            debug!("Index {} did not exist", credentials.index_name);
        }
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Index key for a chunk: URL-safe base64 of its id, since keys only allow
/// letters, digits, `_`, `-` and `=`.
#[inline]
pub fn document_key(chunk_id: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(chunk_id)
}

/// Convert `@search.score` back to cosine similarity. For the cosine metric
/// the service reports `1 / (1 + (1 - cos))`.
#[inline]
pub fn score_to_cosine(score: f32) -> f32 {
    if score > 0.0 {
        (2.0 - score.recip()).clamp(-1.0, 1.0)
    } else {
        -1.0
    }
}

/// Full index definition: chunk fields, the vector field with an HNSW
/// cosine profile and a semantic configuration.
#[inline]
pub fn index_definition(name: &str, dimension: usize) -> Value {
    let text = |name: &str, searchable: bool, filterable: bool| {
        json!({
            "name": name,
            "type": "Edm.String",
            "searchable": searchable,
            "filterable": filterable,
            "retrievable": true,
        })
    };
    json!({
        "name": name,
        "fields": [
            {
                "name": "id",
                "type": "Edm.String",
                "key": true,
                "filterable": true,
                "retrievable": true,
            },
            text("chunk_id", false, true),
            text("doc_id", false, true),
            text("doc_title", true, true),
            text("raw_chunk", true, false),
            text("ctx_header", true, false),
            text("augmented_chunk", true, false),
            text("section_path", true, true),
            text("source_org", false, true),
            text("source_url", false, true),
            {
                "name": "pub_date",
                "type": "Edm.String",
                "filterable": true,
                "sortable": true,
                "retrievable": true,
            },
            {
                "name": "chunk_index",
                "type": "Edm.Int32",
                "filterable": true,
                "sortable": true,
                "retrievable": true,
            },
            {
                "name": VECTOR_FIELD,
                "type": "Collection(Edm.Single)",
                "searchable": true,
                "retrievable": false,
                "dimensions": dimension,
                "vectorSearchProfile": VECTOR_PROFILE,
            },
        ],
        "vectorSearch": {
            "algorithms": [{
                "name": HNSW_CONFIG,
                "kind": "hnsw",
                "hnswParameters": {
                    "m": 4,
                    "efConstruction": 400,
                    "efSearch": 500,
                    "metric": "cosine",
                },
            }],
            "profiles": [{
                "name": VECTOR_PROFILE,
                "algorithm": HNSW_CONFIG,
            }],
        },
        "semantic": {
            "configurations": [{
                "name": SEMANTIC_CONFIG,
                "prioritizedFields": {
                    "titleField": { "fieldName": "doc_title" },
                    "prioritizedContentFields": [
                        { "fieldName": "augmented_chunk" },
                        { "fieldName": "ctx_header" },
                        { "fieldName": "raw_chunk" },
                    ],
                },
            }],
        },
    })
}

fn search_body(query_embedding: &[f32], top_k: usize, filter: &SearchFilter) -> Value {
    let mut body = json!({
        "select": SELECT_FIELDS,
        "top": top_k,
        "vectorQueries": [{
            "kind": "vector",
            "vector": query_embedding,
            "fields": VECTOR_FIELD,
            "k": top_k,
        }],
    });
    if let Some(expression) = filter.to_odata() {
        body["filter"] = Value::String(expression);
        body["vectorFilterMode"] = Value::String("preFilter".to_string());
    }
    body
}

fn index_document<'a>(chunk: &'a Chunk, embedding: &'a [f32]) -> IndexDocument<'a> {
    IndexDocument {
        action: "upload",
        id: document_key(&chunk.chunk_id),
        chunk_id: &chunk.chunk_id,
        doc_id: &chunk.doc_id,
        doc_title: &chunk.doc_title,
        raw_chunk: &chunk.raw_chunk,
        ctx_header: &chunk.ctx_header,
        augmented_chunk: &chunk.augmented_chunk,
        section_path: &chunk.section_path,
        source_org: &chunk.source_org,
        source_url: &chunk.source_url,
        pub_date: &chunk.pub_date,
        chunk_index: chunk.chunk_index,
        embedding,
    }
}

fn service_url(endpoint: &Url, path: &[&str]) -> Result<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|()| RagError::InvalidArgument(format!("{endpoint} cannot be a base URL")))?
        .pop_if_empty()
        .extend(path);
    Ok(url)
}
