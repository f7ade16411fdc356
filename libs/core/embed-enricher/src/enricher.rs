//! Batch enricher: the orchestrator.
//!
//! `enrich` plans sub-batches, runs them concurrently through the
//! limiter and retry policy, and scatters vectors (or per-record errors)
//! back by original index. The returned batch always has the same length
//! and order as the input.

use crate::batch::{self, SubBatch};
use crate::client::{EmbeddingClient, EmbeddingRequest, EmbeddingResponse};
use crate::config::EnricherConfig;
use crate::error::{ConfigError, EnrichError};
use crate::limiter::ConcurrencyLimiter;
use crate::metrics::{self, MetricsTimer};
use crate::record::{Record, RecordFields};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const MISSING_TEXT: &str = "missing text field";

/// Per-batch counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichSummary {
    pub records: usize,
    pub embedded: usize,
    pub failed: usize,
    pub sub_batches: usize,
}

/// Embedding enrichment processor.
///
/// Cloning is cheap and every clone shares the same client, retry policy
/// and concurrency limiter, so concurrent `enrich` calls are bounded
/// together.
pub struct BatchEnricher<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for BatchEnricher<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C> {
    config: EnricherConfig,
    fields: RecordFields,
    retry: RetryPolicy<C>,
    limiter: ConcurrencyLimiter,
}

impl<C> BatchEnricher<C>
where
    C: EmbeddingClient + 'static,
{
    /// Validate `config` and build the processor around `client`.
    pub fn new(config: EnricherConfig, client: C) -> Result<Self, ConfigError> {
        Self::with_arc_client(config, Arc::new(client))
    }

    /// Create the processor with a shared client.
    pub fn with_arc_client(config: EnricherConfig, client: Arc<C>) -> Result<Self, ConfigError> {
        config.validate()?;

        info!(
            model = %config.model,
            batch_size = %config.batch_size,
            concurrency = %config.concurrency,
            max_retries = %config.max_retries,
            timeout_ms = %config.timeout.as_millis(),
            "Batch enricher initialized"
        );

        let inner = Inner {
            fields: RecordFields::from_config(&config),
            retry: RetryPolicy::new(client, &config),
            limiter: ConcurrencyLimiter::new(config.concurrency),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EnricherConfig {
        &self.inner.config
    }

    pub fn fields(&self) -> &RecordFields {
        &self.inner.fields
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    /// Enrich `batch`, returning it in the same order with every record
    /// either embedded or error-tagged.
    pub async fn enrich<R: Record>(&self, batch: Vec<R>, shutdown: watch::Receiver<bool>) -> Vec<R> {
        self.enrich_with_summary(batch, shutdown).await.0
    }

    /// Like [`enrich`](Self::enrich), also returning per-batch counts.
    pub async fn enrich_with_summary<R: Record>(
        &self,
        mut batch: Vec<R>,
        shutdown: watch::Receiver<bool>,
    ) -> (Vec<R>, EnrichSummary) {
        let mut summary = EnrichSummary {
            records: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return (batch, summary);
        }

        let timer = MetricsTimer::new();
        metrics::record_batch_size(batch.len());

        let fields = &self.inner.fields;
        let plan = batch::plan(&batch, fields, self.inner.config.batch_size);
        summary.sub_batches = plan.sub_batches.len();

        for &idx in &plan.missing_text {
            batch[idx].set_error(fields, MISSING_TEXT.to_string());
        }
        summary.failed += plan.missing_text.len();

        // Indices stay behind so a task that never reports back can still be tagged.
        let mut outstanding: Vec<Option<Vec<usize>>> = plan
            .sub_batches
            .iter()
            .map(|sub| Some(sub.indices.clone()))
            .collect();

        let mut join_set: JoinSet<(usize, Result<EmbeddingResponse, EnrichError>)> = JoinSet::new();
        for sub in plan.sub_batches {
            let inner = Arc::clone(&self.inner);
            let mut shutdown = shutdown.clone();
            join_set.spawn(async move {
                let id = sub.id;
                let result = inner.run_sub_batch(sub, &mut shutdown).await;
                (id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (id, result) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    error!(error = %join_err, "Sub-batch task failed");
                    continue;
                }
            };
            let Some(indices) = outstanding.get_mut(id).and_then(Option::take) else {
                continue;
            };

            match check_count(result, indices.len()) {
                Ok(response) => {
                    summary.embedded += indices.len();
                    for (idx, vector) in indices.into_iter().zip(response.vectors) {
                        batch[idx].set_embedding(fields, vector);
                    }
                }
                Err(err) => {
                    warn!(
                        sub_batch = %id,
                        records = indices.len(),
                        error = %err,
                        error_category = ?err.category(),
                        "Sub-batch failed, tagging records"
                    );
                    summary.failed += indices.len();
                    let reason = err.to_string();
                    for idx in indices {
                        batch[idx].set_error(fields, reason.clone());
                    }
                }
            }
        }

        for indices in outstanding.into_iter().flatten() {
            summary.failed += indices.len();
            for idx in indices {
                batch[idx].set_error(fields, "internal error: sub-batch task aborted".to_string());
            }
        }

        metrics::record_records(summary.embedded, summary.failed);
        debug!(
            records = summary.records,
            embedded = summary.embedded,
            failed = summary.failed,
            sub_batches = summary.sub_batches,
            elapsed_ms = %timer.elapsed().as_millis(),
            "Batch enriched"
        );

        (batch, summary)
    }

    /// Release the limiter; later and pending sub-batches fail as cancelled.
    pub fn shutdown(&self) {
        info!("Shutting down batch enricher");
        self.inner.limiter.close();
    }
}

impl<C: EmbeddingClient> Inner<C> {
    async fn run_sub_batch(
        &self,
        sub: SubBatch,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<EmbeddingResponse, EnrichError> {
        let _permit = self.limiter.acquire(shutdown).await?;

        debug!(sub_batch = %sub.id, texts = sub.len(), range = ?sub.range, "Dispatching sub-batch");

        let request = EmbeddingRequest {
            model: self.config.model.clone(),
            input: sub.texts,
            dimensions: if self.config.request_dimensions {
                self.config.dimensions
            } else {
                None
            },
        };

        self.retry.call(&request, shutdown).await
    }
}

fn check_count(
    result: Result<EmbeddingResponse, EnrichError>,
    expected: usize,
) -> Result<EmbeddingResponse, EnrichError> {
    let response = result?;
    if response.vectors.len() != expected {
        return Err(EnrichError::permanent(format!(
            "malformed response: expected {} vectors, got {}",
            expected,
            response.vectors.len()
        )));
    }
    Ok(response)
}
