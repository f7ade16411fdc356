//! Enrichment error types and error categorization
//!
//! Errors are categorized to determine retry behavior:
//! - **Transient**: Network failure, timeout or 5xx, retry with exponential backoff
//! - **RateLimited**: HTTP 429, retry honoring the server's `Retry-After` hint
//! - **Permanent**: Bad request or malformed response, never retried

use std::time::Duration;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retry with exponential backoff
    Transient,
    /// Rate limit hit - retry, preferring the server-provided delay
    RateLimited,
    /// Unrecoverable error - tag the records immediately
    Permanent,
}

impl ErrorCategory {
    /// Whether errors of this category are eligible for another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    /// Label used for metrics and structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

/// Startup configuration errors.
///
/// These are fatal: the processor never starts with a partial configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more required options are absent or empty
    #[error("missing required option(s): {}", .0.join(", "))]
    Missing(Vec<String>),

    /// An option is present but its value cannot be used
    #[error("invalid value for option '{key}': {details}")]
    Invalid { key: String, details: String },

    /// An option name the processor does not recognize
    #[error("unrecognized option '{0}'")]
    Unknown(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, details: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            details: details.into(),
        }
    }
}

/// Errors raised while embedding a sub-batch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrichError {
    /// Timeout, connection reset or server-side failure
    #[error("transient API error: {0}")]
    Transient(String),

    /// HTTP 429 from the embedding API
    #[error("rate limited by embedding API: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Client error or a response that violates the API contract
    #[error("permanent API error: {0}")]
    Permanent(String),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested while the work was pending
    #[error("cancelled")]
    Cancelled,
}

impl EnrichError {
    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        EnrichError::Transient(message.into())
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        EnrichError::Permanent(message.into())
    }

    /// Create a rate limited error with an optional server hint
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        EnrichError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            EnrichError::Transient(_) => ErrorCategory::Transient,
            EnrichError::RateLimited { .. } => ErrorCategory::RateLimited,
            EnrichError::Permanent(_) => ErrorCategory::Permanent,
            EnrichError::Serialization(_) => ErrorCategory::Permanent,
            EnrichError::Cancelled => ErrorCategory::Permanent,
        }
    }

    /// Check if this error should trigger another attempt
    pub fn should_retry(&self) -> bool {
        self.category().is_retryable()
    }

    /// Server-provided delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EnrichError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EnrichError {
    fn from(err: serde_json::Error) -> Self {
        EnrichError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for EnrichError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            EnrichError::Transient(err.to_string())
        } else if err.is_decode() {
            EnrichError::Serialization(err.to_string())
        } else {
            EnrichError::Permanent(err.to_string())
        }
    }
}
