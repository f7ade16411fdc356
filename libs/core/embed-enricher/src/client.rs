//! Embedding API client.
//!
//! One call, one network round trip: no retries happen here. Failures are
//! classified into [`EnrichError`] variants so the retry policy can decide
//! what to do with them.

use crate::config::EnricherConfig;
use crate::error::EnrichError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Texts for one sub-batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

/// Vectors in request order, already validated against the request
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResponse {
    pub vectors: Vec<Vec<f32>>,
}

/// Trait for embedding API clients
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed every text of `request`, giving up at `deadline`
    async fn embed(
        &self,
        request: &EmbeddingRequest,
        deadline: Instant,
    ) -> Result<EmbeddingResponse, EnrichError>;
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    data: Vec<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// HTTP client for OpenAI-compatible embedding endpoints
pub struct HttpEmbeddingClient {
    client: Client,
    url: String,
    api_key: String,
    dimensions: Option<usize>,
    // Without a configured dimension, the first successful response fixes it.
    observed_dimensions: OnceLock<usize>,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EnricherConfig) -> Result<Self, EnrichError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EnrichError::permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, config))
    }

    /// Use a preconfigured `reqwest::Client` (connection pool shared with the host)
    pub fn with_client(client: Client, config: &EnricherConfig) -> Self {
        Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            dimensions: config.dimensions,
            observed_dimensions: OnceLock::new(),
        }
    }

    async fn send(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, EnrichError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, retry_after));
        }

        // A body cut off mid-read is a transport failure, not a bad payload.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EnrichError::transient(format!("failed to read response body: {}", e)))?;
        let wire: WireResponse = serde_json::from_slice(&bytes)?;
        let expected_dim = self.dimensions.or_else(|| self.observed_dimensions.get().copied());
        let response = validate_response(wire, request.input.len(), expected_dim)?;

        if self.dimensions.is_none() {
            if let Some(dim) = response.vectors.first().map(Vec::len) {
                let fixed = *self.observed_dimensions.get_or_init(|| dim);
                if fixed != dim {
                    return Err(EnrichError::permanent(format!(
                        "malformed response: dimension {} differs from earlier responses ({})",
                        dim, fixed
                    )));
                }
            }
        }

        Ok(response)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(
        &self,
        request: &EmbeddingRequest,
        deadline: Instant,
    ) -> Result<EmbeddingResponse, EnrichError> {
        if request.input.is_empty() {
            return Ok(EmbeddingResponse { vectors: vec![] });
        }

        debug!(texts = request.input.len(), model = %request.model, "Embedding request");

        match tokio::time::timeout_at(deadline, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(EnrichError::transient("embedding request timed out")),
        }
    }
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> EnrichError {
    let message = format!("embedding API returned {}: {}", status, truncate(body, 256));
    if status == StatusCode::TOO_MANY_REQUESTS {
        EnrichError::rate_limited(message, retry_after)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        EnrichError::transient(message)
    } else {
        EnrichError::permanent(message)
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// Count, ordering and dimension are part of the API contract and checked
// here rather than trusted.
fn validate_response(
    wire: WireResponse,
    expected: usize,
    dimensions: Option<usize>,
) -> Result<EmbeddingResponse, EnrichError> {
    if wire.data.len() != expected {
        return Err(EnrichError::permanent(format!(
            "malformed response: expected {} vectors, got {}",
            expected,
            wire.data.len()
        )));
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for (position, item) in wire.data.into_iter().enumerate() {
        let index = item.index.unwrap_or(position);
        let slot = slots.get_mut(index).ok_or_else(|| {
            EnrichError::permanent(format!("malformed response: index {} out of range", index))
        })?;
        if slot.is_some() {
            return Err(EnrichError::permanent(format!(
                "malformed response: duplicate index {}",
                index
            )));
        }
        *slot = Some(item.embedding);
    }

    // Every slot is filled: count matched and no index repeated.
    let vectors: Vec<Vec<f32>> = slots.into_iter().flatten().collect();

    let expected_dim = dimensions.or_else(|| vectors.first().map(Vec::len));
    if let Some(dim) = expected_dim {
        if let Some((idx, bad)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dim) {
            return Err(EnrichError::permanent(format!(
                "malformed response: vector {} has dimension {}, expected {}",
                idx,
                bad.len(),
                dim
            )));
        }
    }
    if vectors.iter().any(Vec::is_empty) {
        return Err(EnrichError::permanent("malformed response: empty vector"));
    }

    Ok(EmbeddingResponse { vectors })
}
