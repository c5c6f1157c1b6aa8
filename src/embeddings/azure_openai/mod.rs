
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::{EmbeddingConfig, EmbeddingCredentials, HttpConfig};
use crate::embeddings::EmbeddingProvider;
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::{RagError, Result};

const SERVICE: &str = "Azure OpenAI";
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Azure OpenAI embeddings deployment reached over its REST API.
#[derive(Debug, Clone)]
pub struct AzureOpenAiClient {
    url: Url,
    api_key: String,
    deployment: String,
    dimension: usize,
    http: HttpClient,
    retry_attempts: u32,
    backoff_unit: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl AzureOpenAiClient {
    /// Build a client; fails with a configuration error naming the first
    /// missing endpoint, key or deployment setting.
    #[inline]
    pub fn new(embedding: &EmbeddingConfig, http: &HttpConfig) -> Result<Self> {
        let credentials = embedding.credentials()?;
        Self::from_credentials(
            &credentials,
            embedding.dimension,
            Duration::from_secs(http.timeout_seconds),
        )
        .map(|client| client.with_retry_attempts(embedding.retry_attempts))
    }

    #[inline]
    pub fn from_credentials(
        credentials: &EmbeddingCredentials,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let mut url = credentials
            .endpoint
            .join(&format!(
                "openai/deployments/{}/embeddings",
                credentials.deployment
            ))
            .map_err(|e| {
                RagError::InvalidArgument(format!("Failed to build embeddings URL: {e}"))
            })?;
        url.query_pairs_mut()
            .append_pair("api-version", &credentials.api_version);

        Ok(Self {
            url,
            api_key: credentials.api_key.clone(),
            deployment: credentials.deployment.clone(),
            dimension,
            http: HttpClient::new(SERVICE, timeout),
            retry_attempts: 5,
            backoff_unit: Duration::from_secs(1),
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = HttpClient::new(SERVICE, timeout);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Unit of the exponential backoff between retries.
    #[inline]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    #[inline]
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    async fn request_with_retry(&self, body: &EmbedRequest<'_>) -> Result<HttpResponse> {
        let request = HttpRequest::new(Method::Post, self.url.as_str())
            .header("api-key", self.api_key.as_str())
            .json(body)?;
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("Embedding request attempt {}/{}", attempt, self.retry_attempts);

            match self.http.send(request.clone()).await {
                Ok(response) if response.is_success() => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(response);
                }
                Ok(response) if response.status == 429 || response.status >= 500 => {
                    warn!(
                        "{} returned HTTP {}, attempt {}/{}",
                        SERVICE, response.status, attempt, self.retry_attempts
                    );
                    last_error = Some(RagError::Embedding(format!(
                        "HTTP {} after {} attempts",
                        response.status, self.retry_attempts
                    )));
                }
                Ok(response) => {
                    warn!("Client error (status {}), not retrying", response.status);
                    return Err(match response.into_error(SERVICE) {
                        RagError::Connection(msg) => RagError::Embedding(msg),
                        other => other,
                    });
                }
                Err(e @ (RagError::Connection(_) | RagError::Timeout(_))) => {
                    warn!(
                        "Transport error: {}, attempt {}/{}",
                        e, attempt, self.retry_attempts
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            if attempt < self.retry_attempts {
                let delay = self
                    .backoff_unit
                    .saturating_mul(EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt - 1))
                    .min(MAX_BACKOFF);
                debug!("Waiting {:?} before retry", delay);
                tokio::time::sleep(delay).await;
            }
        }

        error!("All retry attempts failed for request to {}", self.url);
        Err(last_error
            .unwrap_or_else(|| RagError::Embedding("Request failed after retries".to_string())))
    }
}

#[async_trait]
impl EmbeddingProvider for AzureOpenAiClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());
        let response = self.request_with_retry(&EmbedRequest { input: texts }).await?;
        let mut parsed: EmbedResponse = response.json("embedding response")?;

        if parsed.data.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        for vector in &vectors {
            crate::embeddings::check_dimension(self.dimension, vector)?;
        }

        debug!(
            "Generated {} embeddings with {} dimensions",
            vectors.len(),
            self.dimension
        );
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
