mod auth;


use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{RecordStore, StoreStats};
use crate::config::{CosmosConfig, CosmosCredentials, HttpConfig};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::models::{Chunk, Document};
use crate::{RagError, Result};

pub use auth::{master_key_token, request_date};

const SERVICE: &str = "Cosmos DB";
const API_VERSION: &str = "2018-12-31";
const PAGE_SIZE: &str = "1000";
const WRITE_CONCURRENCY: usize = 8;

/// Documents and chunks in two Cosmos DB containers, partitioned on `/id`,
/// reached through the SQL REST API with master-key authorization.
///
/// Settings are checked on every call, so a store built from incomplete
/// configuration fails before any request is sent.
#[derive(Debug, Clone)]
pub struct CosmosRecordStore {
    settings: CosmosConfig,
    http: HttpClient,
}

#[derive(Debug, Serialize)]
struct Item<'a, T> {
    id: &'a str,
    #[serde(flatten)]
    record: &'a T,
}

#[derive(Debug, Deserialize)]
struct FeedPage<T> {
    #[serde(rename = "Documents")]
    documents: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Serialize)]
struct QuerySpec<'a> {
    query: &'a str,
    parameters: Vec<QueryParameter<'a>>,
}

#[derive(Debug, Serialize)]
struct QueryParameter<'a> {
    name: &'a str,
    value: &'a str,
}

/// Which of the two containers a call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Documents,
    Chunks,
}

impl CosmosRecordStore {
    #[inline]
    pub fn new(settings: CosmosConfig, http: &HttpConfig) -> Self {
        Self::with_timeout(settings, Duration::from_secs(http.timeout_seconds))
    }

    #[inline]
    pub fn with_timeout(settings: CosmosConfig, timeout: Duration) -> Self {
        Self {
            settings,
            http: HttpClient::new(SERVICE, timeout),
        }
    }

    fn credentials(&self) -> Result<CosmosCredentials> {
        Ok(self.settings.credentials()?)
    }

    fn container(credentials: &CosmosCredentials, collection: Collection) -> &str {
        match collection {
            Collection::Documents => &credentials.documents_container,
            Collection::Chunks => &credentials.chunks_container,
        }
    }

    fn collection_link(credentials: &CosmosCredentials, collection: Collection) -> String {
        format!(
            "dbs/{}/colls/{}",
            credentials.database,
            Self::container(credentials, collection)
        )
    }

    /// Build a signed request. `resource_link` is the path of the resource the
    /// signature covers; `path` is the URL path actually requested.
    fn signed_request(
        credentials: &CosmosCredentials,
        method: Method,
        path: &[&str],
        resource_type: &str,
        resource_link: &str,
    ) -> Result<HttpRequest> {
        let url = resource_url(&credentials.endpoint, path)?;
        let date = request_date(chrono::Utc::now());
        let token = master_key_token(
            &method.to_string(),
            resource_type,
            resource_link,
            &date,
            &credentials.key,
        )?;

        Ok(HttpRequest::new(method, url.as_str())
            .header("authorization", token)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("Accept", "application/json"))
    }

    /// Every call waits out 429s. The signed date stays valid for fifteen
    /// minutes, well past the bounded retry window.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.http.send_throttled(request, &[429]).await
    }

    /// Read every item of a container, following continuation tokens.
    /// A missing container or database reads as empty.
    async fn read_feed<T: DeserializeOwned + Send>(
        &self,
        credentials: &CosmosCredentials,
        collection: Collection,
    ) -> Result<Vec<T>> {
        let link = Self::collection_link(credentials, collection);
        let container = Self::container(credentials, collection);
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = Self::signed_request(
                credentials,
                Method::Get,
                &["dbs", credentials.database.as_str(), "colls", container, "docs"],
                "docs",
                &link,
            )?
            .header("x-ms-max-item-count", PAGE_SIZE);
            if let Some(token) = &continuation {
                request = request.header("x-ms-continuation", token.as_str());
            }

            let response = self.send(request).await?;
            if response.status == 404 {
                warn!("Container {} not found, treating it as empty", link);
                return Ok(Vec::new());
            }
            if !response.is_success() {
                error!("Failed to read {}: HTTP {}", link, response.status);
                return Err(response.into_error(SERVICE));
            }

            continuation = response.header("x-ms-continuation").map(str::to_string);
            let page: FeedPage<T> = response.json(&format!("items in container {container}"))?;
            debug!("Read {} items from {}", page.documents.len(), link);
            items.extend(page.documents);

            if continuation.is_none() {
                break;
            }
        }

        Ok(items)
    }

    /// Run a parameterised SQL query across all partitions.
    async fn query<T: DeserializeOwned + Send>(
        &self,
        credentials: &CosmosCredentials,
        collection: Collection,
        spec: &QuerySpec<'_>,
    ) -> Result<Vec<T>> {
        let link = Self::collection_link(credentials, collection);
        let container = Self::container(credentials, collection);
        let body = serde_json::to_string(spec)
            .map_err(|e| RagError::InvalidArgument(format!("Failed to encode query: {e}")))?;
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = Self::signed_request(
                credentials,
                Method::Post,
                &["dbs", credentials.database.as_str(), "colls", container, "docs"],
                "docs",
                &link,
            )?
            .header("Content-Type", "application/query+json")
            .header("x-ms-documentdb-isquery", "True")
            .header("x-ms-documentdb-query-enablecrosspartition", "True")
            .header("x-ms-max-item-count", PAGE_SIZE)
            .body(body.as_str());
            if let Some(token) = &continuation {
                request = request.header("x-ms-continuation", token.as_str());
            }

            let response = self.send(request).await?;
            if response.status == 404 {
                warn!("Container {} not found, treating it as empty", link);
                return Ok(Vec::new());
            }
            if !response.is_success() {
                error!("Query on {} failed: HTTP {}", link, response.status);
                return Err(response.into_error(SERVICE));
            }

            continuation = response.header("x-ms-continuation").map(str::to_string);
            let page: FeedPage<T> =
                response.json(&format!("query result from container {container}"))?;
            items.extend(page.documents);

            if continuation.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn list_ids(
        &self,
        credentials: &CosmosCredentials,
        collection: Collection,
    ) -> Result<Vec<String>> {
        let spec = QuerySpec {
            query: "SELECT c.id FROM c",
            parameters: Vec::new(),
        };
        let ids: Vec<IdOnly> = self.query(credentials, collection, &spec).await?;
        Ok(ids.into_iter().map(|i| i.id).collect())
    }

    async fn upsert<T: Serialize + Sync>(
        &self,
        credentials: &CosmosCredentials,
        collection: Collection,
        id: &str,
        record: &T,
    ) -> Result<()> {
        let link = Self::collection_link(credentials, collection);
        let container = Self::container(credentials, collection);
        let request = Self::signed_request(
            credentials,
            Method::Post,
            &["dbs", credentials.database.as_str(), "colls", container, "docs"],
            "docs",
            &link,
        )?
        .header("x-ms-documentdb-is-upsert", "True")
        .header("x-ms-documentdb-partitionkey", partition_key(id)?)
        .json(&Item { id, record })?;

        let response = self.send(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            error!("Failed to save item {} in {}: HTTP {}", id, link, response.status);
            Err(response.into_error(SERVICE))
        }
    }

    async fn delete_item(
        &self,
        credentials: &CosmosCredentials,
        collection: Collection,
        id: &str,
    ) -> Result<()> {
        let container = Self::container(credentials, collection);
        let link = format!("{}/docs/{id}", Self::collection_link(credentials, collection));
        let request = Self::signed_request(
            credentials,
            Method::Delete,
            &["dbs", credentials.database.as_str(), "colls", container, "docs", id],
            "docs",
            &link,
        )?
        .header("x-ms-documentdb-partitionkey", partition_key(id)?);

        let response = self.send(request).await?;
        match response.status {
            200..=299 | 404 => Ok(()),
            _ => {
                error!("Failed to delete {}: HTTP {}", link, response.status);
                Err(response.into_error(SERVICE))
            }
        }
    }

    async fn delete_many(
        &self,
        credentials: &CosmosCredentials,
        collection: Collection,
        ids: &[String],
    ) -> Result<()> {
        let deletes: Vec<BoxFuture<'_, Result<()>>> = ids
            .iter()
            .map(|id| -> BoxFuture<'_, Result<()>> {
                Box::pin(self.delete_item(credentials, collection, id))
            })
            .collect();
        futures::stream::iter(deletes)
            .buffer_unordered(WRITE_CONCURRENCY)
            .try_collect::<()>()
            .await
    }

    /// Upsert every record, then delete items whose id is not in the new set.
    async fn replace_collection<T, F>(
        &self,
        collection: Collection,
        records: &[T],
        id_of: F,
    ) -> Result<()>
    where
        T: Serialize + Sync,
        F: Fn(&T) -> &str + Sync,
    {
        let credentials = self.credentials()?;
        let link = Self::collection_link(&credentials, collection);
        info!("Saving {} items to {}", records.len(), link);

        let writes: Vec<BoxFuture<'_, Result<()>>> = records
            .iter()
            .map(|record| -> BoxFuture<'_, Result<()>> {
                Box::pin(self.upsert(&credentials, collection, id_of(record), record))
            })
            .collect();
        futures::stream::iter(writes)
            .buffer_unordered(WRITE_CONCURRENCY)
            .try_collect::<()>()
            .await?;

        let keep: HashSet<&str> = records.iter().map(&id_of).collect();
        let stale: Vec<String> = self
            .list_ids(&credentials, collection)
            .await?
            .into_iter()
            .filter(|id| !keep.contains(id.as_str()))
            .collect();
        if !stale.is_empty() {
            debug!("Deleting {} stale items from {}", stale.len(), link);
            self.delete_many(&credentials, collection, &stale).await?;
        }

        info!("Successfully saved {} items to {}", records.len(), link);
        Ok(())
    }

    async fn create_resource(
        &self,
        credentials: &CosmosCredentials,
        path: &[&str],
        resource_type: &str,
        parent_link: &str,
        body: &serde_json::Value,
    ) -> Result<bool> {
        let request =
            Self::signed_request(credentials, Method::Post, path, resource_type, parent_link)?
                .json(body)?;
        let response = self.send(request).await?;
        match response.status {
            200..=299 => Ok(true),
            409 => Ok(false),
            _ => Err(response.into_error(SERVICE)),
        }
    }
}

#[async_trait]
impl RecordStore for CosmosRecordStore {
    async fn save_documents(&self, documents: &[Document]) -> Result<()> {
        self.replace_collection(Collection::Documents, documents, |d| d.doc_id.as_str())
            .await
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        let credentials = self.credentials()?;
        let documents: Vec<Document> = self.read_feed(&credentials, Collection::Documents).await?;
        info!("Loaded {} documents", documents.len());
        Ok(documents)
    }

    async fn save_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        self.replace_collection(Collection::Chunks, chunks, |c| c.chunk_id.as_str())
            .await
    }

    async fn load_chunks(&self) -> Result<Vec<Chunk>> {
        let credentials = self.credentials()?;
        let chunks: Vec<Chunk> = self.read_feed(&credentials, Collection::Chunks).await?;
        info!("Loaded {} chunks", chunks.len());
        Ok(chunks)
    }

    async fn get_document_by_id(&self, doc_id: &str) -> Result<Option<Document>> {
        let credentials = self.credentials()?;
        let container = Self::container(&credentials, Collection::Documents);
        let link = format!(
            "{}/docs/{doc_id}",
            Self::collection_link(&credentials, Collection::Documents)
        );
        let request = Self::signed_request(
            &credentials,
            Method::Get,
            &["dbs", credentials.database.as_str(), "colls", container, "docs", doc_id],
            "docs",
            &link,
        )?
        .header("x-ms-documentdb-partitionkey", partition_key(doc_id)?);

        let response = self.send(request).await?;
        match response.status {
            404 => Ok(None),
            200..=299 => response.json(&format!("document {doc_id}")).map(Some),
            _ => Err(response.into_error(SERVICE)),
        }
    }

    async fn get_chunks_by_doc_id(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let credentials = self.credentials()?;
        let spec = QuerySpec {
            query: "SELECT * FROM c WHERE c.doc_id = @doc_id",
            parameters: vec![QueryParameter {
                name: "@doc_id",
                value: doc_id,
            }],
        };
        let mut chunks: Vec<Chunk> = self.query(&credentials, Collection::Chunks, &spec).await?;
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        let credentials = self.credentials()?;
        let document_count = self.list_ids(&credentials, Collection::Documents).await?.len();
        let chunk_count = self.list_ids(&credentials, Collection::Chunks).await?.len();
        Ok(StoreStats {
            document_count,
            chunk_count,
            location: format!("{}dbs/{}", credentials.endpoint, credentials.database),
        })
    }

    async fn purge(&self) -> Result<()> {
        let credentials = self.credentials()?;
        for collection in [Collection::Documents, Collection::Chunks] {
            let ids = self.list_ids(&credentials, collection).await?;
            self.delete_many(&credentials, collection, &ids).await?;
            info!(
                "Deleted {} items from {}",
                ids.len(),
                Self::collection_link(&credentials, collection)
            );
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let credentials = self.credentials()?;
        let database = credentials.database.as_str();

        let created = self
            .create_resource(
                &credentials,
                &["dbs"],
                "dbs",
                "",
                &serde_json::json!({ "id": database }),
            )
            .await?;
        debug!("Database {} created: {}", database, created);

        let db_link = format!("dbs/{database}");
        for collection in [Collection::Documents, Collection::Chunks] {
            let container = Self::container(&credentials, collection);
            let created = self
                .create_resource(
                    &credentials,
                    &["dbs", database, "colls"],
                    "colls",
                    &db_link,
                    &serde_json::json!({
                        "id": container,
                        "partitionKey": { "paths": ["/id"], "kind": "Hash" }
                    }),
                )
                .await?;
            debug!("Container {} created: {}", container, created);
        }

        info!("Cosmos DB database {} is ready", database);
        Ok(())
    }
}

fn resource_url(endpoint: &Url, path: &[&str]) -> Result<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|()| RagError::InvalidArgument(format!("{endpoint} cannot be a base URL")))?
        .pop_if_empty()
        .extend(path);
    Ok(url)
}

fn partition_key(id: &str) -> Result<String> {
    serde_json::to_string(&[id])
        .map_err(|e| RagError::InvalidArgument(format!("Failed to encode partition key: {e}")))
}
