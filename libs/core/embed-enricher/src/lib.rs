//! Embedding Enricher
//!
//! A batch processor that attaches vector embeddings to records by calling
//! an OpenAI-compatible embeddings API.
//!
//! ## Features
//!
//! - **Sub-batching**: large batches are split into API-sized requests
//! - **Bounded concurrency**: one limiter shared by every `enrich` call
//! - **Retries**: exponential backoff for transient and rate-limited failures
//! - **Failure isolation**: a failed sub-batch tags only its own records
//! - **Order preservation**: output has the same length and order as input
//! - **Cancellation**: a shutdown signal interrupts waits and backoff
//!
//! ## Example
//!
//! ```ignore
//! use embed_enricher::{BatchEnricher, EnricherConfig, HttpEmbeddingClient, JsonRecord};
//!
//! let config = EnricherConfig::from_options(&options)?;
//! let client = HttpEmbeddingClient::new(&config)?;
//! let enricher = BatchEnricher::new(config, client)?;
//!
//! let (_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let enriched: Vec<JsonRecord> = enricher.enrich(records, shutdown_rx).await;
//! ```

mod batch;
mod client;
mod config;
mod enricher;
mod error;
mod limiter;
pub mod metrics;
mod record;
mod retry;
mod shutdown;

// Re-export main types
pub use batch::{BatchPlan, SubBatch, partition, plan};
pub use client::{
    EmbeddingClient, EmbeddingRequest, EmbeddingResponse, HttpEmbeddingClient, classify_status,
};
pub use config::{
    BackoffConfig, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT,
    EnricherConfig, KNOWN_OPTIONS, MAX_BATCH_SIZE, known_model_dimensions, parse_duration,
};
pub use enricher::{BatchEnricher, EnrichSummary, MISSING_TEXT};
pub use error::{ConfigError, EnrichError, ErrorCategory};
pub use limiter::{ConcurrencyLimiter, LimiterPermit, RateGate};
pub use record::{JsonRecord, Record, RecordFields};
pub use retry::RetryPolicy;
pub use shutdown::{cancelled, is_cancelled};
