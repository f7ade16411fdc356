//! Metrics for the enrichment processor
//!
//! Recorded through the `metrics` facade; the host decides which exporter
//! (if any) is installed.

use crate::error::ErrorCategory;
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Outcome label for a single API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failed(ErrorCategory),
}

impl CallOutcome {
    fn label(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failed(category) => category.as_str(),
        }
    }
}

/// Record one embedding API call
pub fn record_api_call(model: &str, outcome: CallOutcome, duration: Duration) {
    counter!(
        "enricher_api_calls_total",
        "model" => model.to_string(),
        "outcome" => outcome.label()
    )
    .increment(1);

    histogram!("enricher_api_call_duration_seconds", "model" => model.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retry scheduled after a retryable failure
pub fn record_retry(model: &str, category: ErrorCategory) {
    counter!(
        "enricher_api_retries_total",
        "model" => model.to_string(),
        "category" => category.as_str()
    )
    .increment(1);
}

/// Record per-record results of one batch
pub fn record_records(embedded: usize, failed: usize) {
    counter!("enricher_records_total", "status" => "embedded").increment(embedded as u64);
    counter!("enricher_records_total", "status" => "failed").increment(failed as u64);
}

/// Record the size of an incoming batch
pub fn record_batch_size(size: usize) {
    histogram!("enricher_batch_size").record(size as f64);
}

/// Update the in-flight sub-batch gauge
pub fn set_in_flight(count: usize) {
    gauge!("enricher_sub_batches_in_flight").set(count as f64);
}

/// Records the elapsed time of a whole batch when dropped
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for MetricsTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        histogram!("enricher_batch_duration_seconds").record(self.start.elapsed().as_secs_f64());
    }
}
