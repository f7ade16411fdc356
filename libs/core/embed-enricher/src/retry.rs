//! Retry policy around the embedding client.
//!
//! Transient and rate-limited failures are retried with exponential
//! backoff (`base * multiplier^(n-1)`, capped). Permanent failures return
//! immediately. Every wait races the shutdown signal.

use crate::client::{EmbeddingClient, EmbeddingRequest, EmbeddingResponse};
use crate::config::{BackoffConfig, EnricherConfig};
use crate::error::EnrichError;
use crate::limiter::RateGate;
use crate::metrics::{self, CallOutcome};
use crate::shutdown::{cancelled, is_cancelled};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bounded retries with exponential backoff for one sub-batch call
pub struct RetryPolicy<C> {
    client: Arc<C>,
    model: String,
    max_retries: u32,
    timeout: Duration,
    backoff: BackoffConfig,
    rate_gate: Option<RateGate>,
}

impl<C: EmbeddingClient> RetryPolicy<C> {
    pub fn new(client: Arc<C>, config: &EnricherConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            max_retries: config.max_retries,
            timeout: config.timeout,
            backoff: config.backoff,
            rate_gate: config.rate_limit_rps.map(RateGate::per_second),
        }
    }

    /// Total attempts allowed: the first call plus `max_retries` retries
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `retry` (1-based) after `error`
    pub fn delay_for(&self, retry: u32, error: &EnrichError) -> Duration {
        match error.retry_after() {
            Some(hint) => self.backoff.clamp(hint),
            None => self.backoff.delay_for_retry(retry),
        }
    }

    /// Run the request until it succeeds, fails permanently, runs out of
    /// attempts, or shutdown is requested.
    pub async fn call(
        &self,
        request: &EmbeddingRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<EmbeddingResponse, EnrichError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if is_cancelled(shutdown) {
                return Err(EnrichError::Cancelled);
            }

            if let Some(gate) = &self.rate_gate {
                gate.ready(shutdown).await?;
            }

            let started = std::time::Instant::now();
            let deadline = Instant::now() + self.timeout;
            let result = tokio::select! {
                biased;
                _ = cancelled(shutdown) => return Err(EnrichError::Cancelled),
                result = self.client.embed(request, deadline) => result,
            };

            let error = match result {
                Ok(response) => {
                    metrics::record_api_call(&self.model, CallOutcome::Success, started.elapsed());
                    if attempt > 1 {
                        debug!(attempt = %attempt, texts = request.input.len(), "Embedding call succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            let category = error.category();
            metrics::record_api_call(&self.model, CallOutcome::Failed(category), started.elapsed());

            if !error.should_retry() {
                debug!(error = %error, error_category = ?category, "Permanent failure - not retrying");
                return Err(error);
            }

            if attempt >= self.max_attempts() {
                warn!(
                    attempts = %attempt,
                    error = %error,
                    error_category = ?category,
                    "Embedding call exhausted retries"
                );
                return Err(error);
            }

            let delay = self.delay_for(attempt, &error);
            metrics::record_retry(&self.model, category);
            warn!(
                attempt = %attempt,
                max_attempts = %self.max_attempts(),
                delay_ms = %delay.as_millis(),
                error = %error,
                error_category = ?category,
                "Embedding call failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancelled(shutdown) => return Err(EnrichError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
