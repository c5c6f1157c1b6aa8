
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{RagError, Result};

/// Longest response body excerpt carried into an error message.
const ERROR_BODY_PREVIEW: usize = 300;
const MAX_BODY_BYTES: u64 = 256 * 1024 * 1024;

/// Sends made for one request before a throttling status is handed back.
pub const THROTTLE_ATTEMPTS: u32 = 5;
/// Wait per attempt when the service does not say how long to back off.
const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_millis(500);
const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    #[inline]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[inline]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[inline]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    #[inline]
    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_string(value)
            .map_err(|e| RagError::InvalidArgument(format!("Failed to encode request: {e}")))?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Back-off the service asked for, from `x-ms-retry-after-ms`,
    /// `retry-after-ms` or `Retry-After` (seconds), in that order.
    #[inline]
    pub fn retry_after(&self) -> Option<Duration> {
        let parse = |name: &str| self.header(name)?.trim().parse::<u64>().ok();
        parse("x-ms-retry-after-ms")
            .or_else(|| parse("retry-after-ms"))
            .map(Duration::from_millis)
            .or_else(|| parse("retry-after").map(Duration::from_secs))
    }

    /// Parse the body, reporting schema drift as a data integrity failure.
    #[inline]
    pub fn json<T: DeserializeOwned>(&self, what: &str) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| RagError::DataIntegrity(format!("Malformed {what}: {e}")))
    }

    /// Turn a non-success status into the error class callers expect.
    #[inline]
    pub fn into_error(self, service: &str) -> RagError {
        let preview: String = self.body.chars().take(ERROR_BODY_PREVIEW).collect();
        match self.status {
            401 | 403 => RagError::Connection(format!(
                "{service} rejected the credentials (HTTP {}): {preview}",
                self.status
            )),
            408 => RagError::Timeout(format!("{service} request timed out (HTTP 408)")),
            429 => RagError::Throttled(format!(
                "{service} is throttling requests (HTTP 429): {preview}"
            )),
            status => RagError::Connection(format!("{service} returned HTTP {status}: {preview}")),
        }
    }
}

/// Blocking ureq agent driven from the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
    timeout: Duration,
    service: &'static str,
}

impl HttpClient {
    #[inline]
    pub fn new(service: &'static str, timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            timeout,
            service,
        }
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    pub fn service(&self) -> &'static str {
        self.service
    }

    /// Send a request. Any HTTP status is returned as a response; only
    /// transport failures become errors.
    #[inline]
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} {} {}", self.service, request.method, request.url);
        let agent = self.agent.clone();
        let service = self.service;

        tokio::task::spawn_blocking(move || execute(&agent, &request))
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("{service} request task failed: {e}")))?
            .map_err(|e| transport_error(service, e))
    }

    /// Send a request, waiting out any status in `retry_on` for up to
    /// [`THROTTLE_ATTEMPTS`] sends. The last response is returned as is,
    /// so an exhausted retry still reaches [`HttpResponse::into_error`].
    #[inline]
    pub async fn send_throttled(
        &self,
        request: HttpRequest,
        retry_on: &[u16],
    ) -> Result<HttpResponse> {
        let mut attempt = 1;
        loop {
            let response = self.send(request.clone()).await?;
            if attempt >= THROTTLE_ATTEMPTS || !retry_on.contains(&response.status) {
                return Ok(response);
            }

            let delay = response
                .retry_after()
                .unwrap_or_else(|| DEFAULT_THROTTLE_DELAY.saturating_mul(attempt))
                .min(MAX_THROTTLE_DELAY);
            warn!(
                "{} returned HTTP {}, retrying in {:?} (attempt {}/{})",
                self.service, response.status, delay, attempt, THROTTLE_ATTEMPTS
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn execute(agent: &ureq::Agent, request: &HttpRequest) -> std::result::Result<HttpResponse, ureq::Error> {
    let url = request.url.as_str();
    let mut response = match request.method {
        Method::Get => with_headers(agent.get(url), &request.headers).call()?,
        Method::Delete => with_headers(agent.delete(url), &request.headers).call()?,
        Method::Post => send_body(with_headers(agent.post(url), &request.headers), request)?,
        Method::Put => send_body(with_headers(agent.put(url), &request.headers), request)?,
    };

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response
        .body_mut()
        .with_config()
        .limit(MAX_BODY_BYTES)
        .read_to_string()?;

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn with_headers<B>(
    mut builder: ureq::RequestBuilder<B>,
    headers: &[(String, String)],
) -> ureq::RequestBuilder<B> {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn send_body(
    builder: ureq::RequestBuilder<ureq::typestate::WithBody>,
    request: &HttpRequest,
) -> std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error> {
    match &request.body {
        Some(body) => builder.send(body.as_str()),
        None => builder.send_empty(),
    }
}

fn transport_error(service: &str, error: ureq::Error) -> RagError {
    match error {
        ureq::Error::Timeout(kind) => {
            RagError::Timeout(format!("{service} request exceeded its time limit ({kind:?})"))
        }
        ureq::Error::Io(ref io) if io.kind() == std::io::ErrorKind::TimedOut => {
            RagError::Timeout(format!("{service} request timed out: {io}"))
        }
        other => RagError::Connection(format!("{service} unreachable: {other}")),
    }
}
