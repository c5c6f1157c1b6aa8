// Shared fixtures for the integration tests: a deterministic embedder, a
// small guideline corpus and in-memory fakes of the two Azure services.

#![allow(dead_code, reason = "each test crate uses a different subset")]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use medctx::config::{Config, StorageMode};
use medctx::embeddings::EmbeddingProvider;
use medctx::models::{Chunk, Document};
use medctx::{RagError, Result};

pub const DIM: usize = 64;

pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("medctx=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Bag-of-words embedder: each lowercased word adds one to a hashed bucket.
#[derive(Debug, Default)]
pub struct HashingEmbedder {
    calls: AtomicUsize,
    texts: AtomicUsize,
    fail: bool,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of `embed_batch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts embedded so far.
    pub fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; DIM];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7_usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)));
            vector[bucket % DIM] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RagError::Embedding("service unavailable".to_string()));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

pub fn document(doc_id: &str, title: &str, source_org: &str, pub_date: &str) -> Document {
    Document {
        doc_id: doc_id.to_string(),
        title: title.to_string(),
        content: format!("{title}. Full guideline text."),
        source_url: format!("https://guidelines.example.org/{doc_id}"),
        source_org: source_org.to_string(),
        pub_date: pub_date.to_string(),
    }
}

/// Three guidelines split into two chunks each, in ingestion order.
pub fn guideline_corpus() -> (Vec<Document>, Vec<Chunk>) {
    let documents = vec![
        document("ng136", "Hypertension in adults", "NICE", "2019-08-28"),
        document("ng28", "Type 2 diabetes in adults", "NICE", "2015-12-02"),
        document("sign158", "Asthma management", "SIGN", "2019-07-01"),
    ];
    let chunks = vec![
        Chunk::new(
            &documents[0],
            0,
            "Diagnosis",
            "Hypertension diagnosis. ",
            "Measure clinic blood pressure in both arms.",
        ),
        Chunk::new(
            &documents[0],
            1,
            "Treatment",
            "Hypertension treatment. ",
            "Offer an ACE inhibitor or ARB as first step antihypertensive treatment.",
        ),
        Chunk::new(
            &documents[1],
            0,
            "Treatment",
            "Diabetes treatment. ",
            "Offer standard release metformin as initial drug treatment.",
        ),
        Chunk::new(
            &documents[1],
            1,
            "Monitoring",
            "Diabetes monitoring. ",
            "Measure HbA1c levels at 3 to 6 monthly intervals.",
        ),
        Chunk::new(
            &documents[2],
            0,
            "Treatment",
            "Asthma treatment. ",
            "Inhaled corticosteroids are the recommended preventer drug.",
        ),
        Chunk::new(
            &documents[2],
            1,
            "Diagnosis",
            "Asthma diagnosis. ",
            "Spirometry supports the diagnosis of asthma in adults.",
        ),
    ];
    (documents, chunks)
}

/// `doc_count` documents with two chunks each.
pub fn numbered_corpus(doc_count: usize) -> (Vec<Document>, Vec<Chunk>) {
    let documents: Vec<Document> = (0..doc_count)
        .map(|i| document(&format!("cg{i}"), &format!("Guideline {i}"), "NICE", "2020-01-01"))
        .collect();
    let chunks = documents
        .iter()
        .enumerate()
        .flat_map(|(i, doc)| {
            (0..2_u32).map(move |j| {
                Chunk::new(
                    doc,
                    j,
                    format!("Section {j}"),
                    format!("Guideline {i} section {j}. "),
                    format!("Recommendation {j} about condition{i} and symptom{j}."),
                )
            })
        })
        .collect();
    (documents, chunks)
}

pub fn local_config(dir: &TempDir) -> Config {
    let mut config = Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    config.embedding.dimension = DIM;
    config.embedding.batch_size = 4;
    config.embedding.batch_delay_seconds = 0.0;
    config
}

/// Managed configuration pointing Cosmos DB and Azure AI Search at the
/// given fake servers.
pub fn managed_config(dir: &TempDir, cosmos: &MockServer, search: &MockServer) -> Config {
    let mut config = local_config(dir);
    config.storage_mode = StorageMode::Managed;
    config.cosmos.endpoint = Some(cosmos.uri());
    config.cosmos.key = Some("dGVzdC1tYXN0ZXIta2V5".to_string());
    config.search.endpoint = Some(search.uri());
    config.search.key = Some("search-admin-key".to_string());
    config.search.upload_batch_size = 4;
    config.http.timeout_seconds = 5;
    config
}

fn segments(request: &Request) -> Vec<String> {
    request
        .url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

/// In-memory Cosmos DB SQL API: item upserts, point reads and deletes,
/// feeds and the two queries the record store issues.
#[derive(Debug, Clone, Default)]
pub struct FakeCosmos {
    containers: Arc<Mutex<Vec<(String, Vec<(String, Value)>)>>>,
}

impl FakeCosmos {
    pub async fn start() -> (MockServer, Self) {
        let server = MockServer::start().await;
        let fake = Self::default();
        Mock::given(any())
            .respond_with(fake.clone())
            .mount(&server)
            .await;
        (server, fake)
    }

    /// Items of one container, in first-write order.
    pub fn items(&self, container: &str) -> Vec<Value> {
        let containers = self.containers.lock().expect("lock");
        containers
            .iter()
            .find(|(name, _)| name == container)
            .map(|(_, items)| items.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    fn with_container<T>(
        &self,
        container: &str,
        f: impl FnOnce(&mut Vec<(String, Value)>) -> T,
    ) -> Option<T> {
        let mut containers = self.containers.lock().expect("lock");
        containers
            .iter_mut()
            .find(|(name, _)| name == container)
            .map(|(_, items)| f(items))
    }

    fn create_container(&self, container: &str) -> bool {
        let mut containers = self.containers.lock().expect("lock");
        if containers.iter().any(|(name, _)| name == container) {
            return false;
        }
        containers.push((container.to_string(), Vec::new()));
        true
    }

    fn query(&self, container: &str, body: &[u8]) -> ResponseTemplate {
        let spec: Value = serde_json::from_slice(body).expect("query body");
        let text = spec["query"].as_str().unwrap_or_default();
        let doc_id = spec["parameters"]
            .as_array()
            .and_then(|params| params.iter().find(|p| p["name"] == "@doc_id"))
            .map(|p| p["value"].clone());

        let Some(items) = self.with_container(container, |items| {
            items
                .iter()
                .map(|(_, v)| v)
                .filter(|v| doc_id.as_ref().is_none_or(|want| &v["doc_id"] == want))
                .map(|v| {
                    if text.starts_with("SELECT c.id") {
                        json!({ "id": v["id"] })
                    } else {
                        v.clone()
                    }
                })
                .collect::<Vec<_>>()
        }) else {
            return ResponseTemplate::new(404);
        };
        feed(items)
    }
}

fn feed(items: Vec<Value>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "_count": items.len(), "Documents": items }))
}

impl Respond for FakeCosmos {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        assert!(
            header(request, "authorization").is_some_and(|a| a.starts_with("type%3Dmaster")),
            "unsigned request to {}",
            request.url
        );
        let path = segments(request);
        let method = request.method.as_str();
        let parts: Vec<&str> = path.iter().map(String::as_str).collect();

        match (method, parts.as_slice()) {
            ("POST", ["dbs"]) => ResponseTemplate::new(201).set_body_json(json!({})),
            ("POST", ["dbs", _, "colls"]) => {
                let body: Value = serde_json::from_slice(&request.body).expect("container body");
                let id = body["id"].as_str().unwrap_or_default();
                let status = if self.create_container(id) { 201 } else { 409 };
                ResponseTemplate::new(status).set_body_json(json!({}))
            }
            ("GET", ["dbs", _, "colls", container, "docs"]) => {
                match self.with_container(container, |items| {
                    items.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>()
                }) {
                    Some(items) => feed(items),
                    None => ResponseTemplate::new(404),
                }
            }
            ("POST", ["dbs", _, "colls", container, "docs"])
                if header(request, "x-ms-documentdb-isquery").is_some() =>
            {
                self.query(container, &request.body)
            }
            ("POST", ["dbs", _, "colls", container, "docs"]) => {
                let item: Value = serde_json::from_slice(&request.body).expect("item body");
                let id = item["id"].as_str().unwrap_or_default().to_string();
                let stored = self.with_container(container, |items| {
                    match items.iter_mut().find(|(key, _)| *key == id) {
                        Some(existing) => existing.1 = item.clone(),
                        None => items.push((id.clone(), item.clone())),
                    }
                });
                match stored {
                    Some(()) => ResponseTemplate::new(201).set_body_json(item),
                    None => ResponseTemplate::new(404),
                }
            }
            ("GET", ["dbs", _, "colls", container, "docs", id]) => {
                let found = self
                    .with_container(container, |items| {
                        items
                            .iter()
                            .find(|(key, _)| key.as_str() == *id)
                            .map(|(_, v)| v.clone())
                    })
                    .flatten();
                match found {
                    Some(item) => ResponseTemplate::new(200).set_body_json(item),
                    None => ResponseTemplate::new(404),
                }
            }
            ("DELETE", ["dbs", _, "colls", container, "docs", id]) => {
                let removed = self
                    .with_container(container, |items| {
                        let before = items.len();
                        items.retain(|(key, _)| key.as_str() != *id);
                        before != items.len()
                    })
                    .unwrap_or(false);
                ResponseTemplate::new(if removed { 204 } else { 404 })
            }
            _ => ResponseTemplate::new(400),
        }
    }
}

#[derive(Debug, Default)]
struct SearchState {
    definition: Option<Value>,
    documents: Vec<(String, Value)>,
}

/// In-memory Azure AI Search: one index with brute-force cosine vector
/// queries, reporting `1 / (2 - cosine)` as the search score.
#[derive(Debug, Clone, Default)]
pub struct FakeSearch {
    state: Arc<Mutex<SearchState>>,
}

impl FakeSearch {
    pub async fn start() -> (MockServer, Self) {
        let server = MockServer::start().await;
        let fake = Self::default();
        Mock::given(any())
            .respond_with(fake.clone())
            .mount(&server)
            .await;
        (server, fake)
    }

    pub fn document_count(&self) -> usize {
        self.state.lock().expect("lock").documents.len()
    }

    pub fn has_index(&self) -> bool {
        self.state.lock().expect("lock").definition.is_some()
    }

    fn upload(&self, body: &[u8]) -> ResponseTemplate {
        let batch: Value = serde_json::from_slice(body).expect("upload body");
        let mut state = self.state.lock().expect("lock");
        let mut results = Vec::new();
        for doc in batch["value"].as_array().cloned().unwrap_or_default() {
            let key = doc["id"].as_str().unwrap_or_default().to_string();
            match state.documents.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = doc,
                None => state.documents.push((key.clone(), doc)),
            }
            results.push(json!({ "key": key, "status": true, "errorMessage": null, "statusCode": 201 }));
        }
        ResponseTemplate::new(200).set_body_json(json!({ "value": results }))
    }

    fn search(&self, body: &[u8]) -> ResponseTemplate {
        let query: Value = serde_json::from_slice(body).expect("search body");
        let vector: Vec<f64> = query["vectorQueries"][0]["vector"]
            .as_array()
            .map(|v| v.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        let top = query["top"].as_u64().unwrap_or(50) as usize;
        let filter = query["filter"].as_str().unwrap_or_default();

        let state = self.state.lock().expect("lock");
        let mut scored: Vec<(f64, Value)> = state
            .documents
            .iter()
            .map(|(_, doc)| doc)
            .filter(|doc| odata_matches(filter, doc))
            .map(|doc| {
                let embedding: Vec<f64> = doc["embedding"]
                    .as_array()
                    .map(|v| v.iter().filter_map(Value::as_f64).collect())
                    .unwrap_or_default();
                let score = 1.0 / (2.0 - cosine(&vector, &embedding));
                let mut hit = doc.clone();
                if let Some(fields) = hit.as_object_mut() {
                    fields.remove("embedding");
                    fields.remove("@search.action");
                    fields.insert("@search.score".to_string(), json!(score));
                }
                (score, hit)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        let value: Vec<Value> = scored.into_iter().take(top).map(|(_, hit)| hit).collect();
        ResponseTemplate::new(200).set_body_json(json!({ "value": value }))
    }
}

impl Respond for FakeSearch {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        assert_eq!(header(request, "api-key"), Some("search-admin-key"));
        let path = segments(request);
        let parts: Vec<&str> = path.iter().map(String::as_str).collect();
        let exists = self.has_index();

        match (request.method.as_str(), parts.as_slice()) {
            ("GET", ["indexes", _]) => {
                let state = self.state.lock().expect("lock");
                match &state.definition {
                    Some(definition) => ResponseTemplate::new(200).set_body_json(definition),
                    None => ResponseTemplate::new(404),
                }
            }
            ("PUT", ["indexes", _]) => {
                let definition: Value = serde_json::from_slice(&request.body).expect("definition");
                let mut state = self.state.lock().expect("lock");
                state.definition = Some(definition.clone());
                state.documents.clear();
                ResponseTemplate::new(201).set_body_json(definition)
            }
            ("DELETE", ["indexes", _]) => {
                let mut state = self.state.lock().expect("lock");
                let status = if state.definition.take().is_some() { 204 } else { 404 };
                state.documents.clear();
                ResponseTemplate::new(status)
            }
            (_, ["indexes", _, "docs", ..]) if !exists => ResponseTemplate::new(404),
            ("GET", ["indexes", _, "docs", "$count"]) => {
                ResponseTemplate::new(200).set_body_string(format!("\u{feff}{}", self.document_count()))
            }
            ("POST", ["indexes", _, "docs", "index"]) => self.upload(&request.body),
            ("POST", ["indexes", _, "docs", "search"]) => self.search(&request.body),
            _ => ResponseTemplate::new(400),
        }
    }
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

/// Evaluate the `field op 'literal'` clauses joined by `and` that the
/// index emits.
fn odata_matches(filter: &str, doc: &Value) -> bool {
    if filter.is_empty() {
        return true;
    }
    filter.split(" and ").all(|clause| {
        let mut parts = clause.splitn(3, ' ');
        let (Some(field), Some(op), Some(literal)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let want = literal.trim_matches('\'').replace("''", "'");
        let have = doc[field].as_str().unwrap_or_default();
        match op {
            "eq" => have == want,
            "ge" => have >= want.as_str(),
            "le" => have <= want.as_str(),
            _ => false,
        }
    })
}
