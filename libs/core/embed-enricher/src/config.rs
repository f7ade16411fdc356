//! Enricher configuration
//!
//! `EnricherConfig` is built once at startup, either from the pipeline's
//! option map via [`EnricherConfig::from_options`] or with the builder
//! methods, and is shared read-only by every component afterwards.

use crate::error::ConfigError;
use reqwest::Url;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 2048;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Every option key accepted by [`EnricherConfig::from_options`].
pub const KNOWN_OPTIONS: &[&str] = &[
    "url",
    "api_key",
    "model",
    "dimensions",
    "batch_size",
    "concurrency",
    "timeout",
    "max_retries",
    "backoff_base",
    "backoff_multiplier",
    "backoff_cap",
    "rate_limit_rps",
    "text_field",
    "embedding_field",
    "error_field",
];

/// Output dimension of well-known embedding models.
pub fn known_model_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "text-embedding-ada-002" => Some(1536),
        _ => None,
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`, capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.cap.as_nanos() as f64);
        Duration::from_nanos(capped.round() as u64)
    }

    /// Clamp a server-provided delay to the configured cap
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.cap)
    }
}

/// Configuration for the batch enricher
#[derive(Clone)]
pub struct EnricherConfig {
    /// Embedding API endpoint
    pub url: String,

    /// Bearer credential for the embedding API
    pub api_key: String,

    /// Model identifier sent with each request
    pub model: String,

    /// Expected vector dimension (None = accept whatever the API returns, if consistent)
    pub dimensions: Option<usize>,

    /// Whether `dimensions` is forwarded to the API in each request
    pub request_dimensions: bool,

    /// Maximum texts per API call
    pub batch_size: usize,

    /// Maximum simultaneous in-flight API calls
    pub concurrency: usize,

    /// Per-call deadline
    pub timeout: Duration,

    /// Retries after the first attempt on transient failure
    pub max_retries: u32,

    /// Backoff between attempts
    pub backoff: BackoffConfig,

    /// Optional ceiling on API calls per second
    pub rate_limit_rps: Option<NonZeroU32>,

    /// Record field holding the text to embed
    pub text_field: String,

    /// Record field receiving the vector
    pub embedding_field: String,

    /// Record field receiving the failure reason
    pub error_field: String,
}

impl EnricherConfig {
    /// Create a config with the required values and defaults for everything else
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            url: url.into(),
            api_key: api_key.into(),
            dimensions: known_model_dimensions(&model),
            model,
            request_dimensions: false,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffConfig::default(),
            rate_limit_rps: None,
            text_field: "text".to_string(),
            embedding_field: "embedding".to_string(),
            error_field: "error".to_string(),
        }
    }

    /// Parse and validate the pipeline's raw option map.
    ///
    /// All missing required options are reported together; the first
    /// malformed value aborts parsing.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut unknown: Vec<&String> = options
            .keys()
            .filter(|key| !KNOWN_OPTIONS.contains(&key.as_str()))
            .collect();
        unknown.sort();
        if let Some(key) = unknown.first() {
            return Err(ConfigError::Unknown(key.to_string()));
        }

        let get = |key: &str| {
            options
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let mut config = match (get("url"), get("api_key"), get("model")) {
            (Some(url), Some(api_key), Some(model)) => Self::new(url, api_key, model),
            _ => {
                let missing = ["url", "api_key", "model"]
                    .into_iter()
                    .filter(|key| get(key).is_none())
                    .map(str::to_string)
                    .collect();
                return Err(ConfigError::Missing(missing));
            }
        };

        if let Some(v) = get("dimensions") {
            config = config.with_dimensions(parse_number("dimensions", v)?);
        }
        if let Some(v) = get("batch_size") {
            config.batch_size = parse_number("batch_size", v)?;
        }
        if let Some(v) = get("concurrency") {
            config.concurrency = parse_number("concurrency", v)?;
        }
        if let Some(v) = get("timeout") {
            config.timeout = parse_duration("timeout", v)?;
        }
        if let Some(v) = get("max_retries") {
            config.max_retries = parse_number("max_retries", v)?;
        }
        if let Some(v) = get("backoff_base") {
            config.backoff.base = parse_duration("backoff_base", v)?;
        }
        if let Some(v) = get("backoff_multiplier") {
            config.backoff.multiplier = parse_number("backoff_multiplier", v)?;
        }
        if let Some(v) = get("backoff_cap") {
            config.backoff.cap = parse_duration("backoff_cap", v)?;
        }
        if let Some(v) = get("rate_limit_rps") {
            let rps: u32 = parse_number("rate_limit_rps", v)?;
            config.rate_limit_rps = Some(
                NonZeroU32::new(rps)
                    .ok_or_else(|| ConfigError::invalid("rate_limit_rps", "must be at least 1"))?,
            );
        }
        if let Some(v) = get("text_field") {
            config.text_field = v.to_string();
        }
        if let Some(v) = get("embedding_field") {
            config.embedding_field = v.to_string();
        }
        if let Some(v) = get("error_field") {
            config.error_field = v.to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the builder methods cannot enforce on their own
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<String> = [
            ("url", &self.url),
            ("api_key", &self.api_key),
            ("model", &self.model),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(key, _)| key.to_string())
        .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let url = Url::parse(&self.url).map_err(|e| ConfigError::invalid("url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "batch_size",
                format!("must be 1-{}, got {}", MAX_BATCH_SIZE, self.batch_size),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }
        if self.dimensions == Some(0) {
            return Err(ConfigError::invalid("dimensions", "must be at least 1"));
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("must be a finite number >= 1.0, got {}", self.backoff.multiplier),
            ));
        }
        if self.backoff.base > self.backoff.cap {
            return Err(ConfigError::invalid(
                "backoff_cap",
                "must not be smaller than backoff_base",
            ));
        }

        for (key, field) in [
            ("text_field", &self.text_field),
            ("embedding_field", &self.embedding_field),
            ("error_field", &self.error_field),
        ] {
            if field.is_empty() {
                return Err(ConfigError::invalid(key, "must not be empty"));
            }
        }
        if self.embedding_field == self.error_field {
            return Err(ConfigError::invalid(
                "error_field",
                "must differ from embedding_field",
            ));
        }

        Ok(())
    }

    /// Set the expected dimension and forward it to the API
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self.request_dimensions = true;
        self
    }

    /// Set the maximum texts per API call
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the maximum in-flight API calls
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the per-call deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff parameters
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Limit API calls per second
    pub fn with_rate_limit(mut self, rps: NonZeroU32) -> Self {
        self.rate_limit_rps = Some(rps);
        self
    }

    /// Set the record field that holds the text
    pub fn with_text_field(mut self, field: impl Into<String>) -> Self {
        self.text_field = field.into();
        self
    }
}

impl fmt::Debug for EnricherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnricherConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("text_field", &self.text_field)
            .finish_non_exhaustive()
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{}': {}", value, e)))
}

/// Parse `250ms`, `5s`, `2m`, or a bare integer meaning seconds.
pub fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a duration", value)))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        other => Err(ConfigError::invalid(
            key,
            format!("unknown duration unit '{}' (use ms, s or m)", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("url", "https://api.openai.com/v1/embeddings"),
            ("api_key", "sk-test"),
            ("model", "text-embedding-3-small"),
        ]
    }

    #[test]
    fn test_defaults_applied() {
        let config = EnricherConfig::from_options(&options(&required())).unwrap();

        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.dimensions, Some(1536));
        assert!(!config.request_dimensions);
        assert_eq!(config.text_field, "text");
    }

    #[test]
    fn test_all_missing_fields_reported() {
        let err = EnricherConfig::from_options(&options(&[("model", "m")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["url".to_string(), "api_key".to_string()])
        );
    }

    #[test]
    fn test_blank_required_field_is_missing() {
        let mut pairs = required();
        pairs[1] = ("api_key", "   ");
        let err = EnricherConfig::from_options(&options(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::Missing(vec!["api_key".to_string()]));
    }

    #[test]
    fn test_optional_overrides() {
        let mut pairs = required();
        pairs.extend([
            ("batch_size", "16"),
            ("concurrency", "8"),
            ("timeout", "1500ms"),
            ("max_retries", "5"),
            ("dimensions", "256"),
            ("backoff_base", "100ms"),
            ("backoff_multiplier", "3"),
            ("backoff_cap", "2s"),
            ("rate_limit_rps", "20"),
            ("text_field", "body"),
        ]);
        let config = EnricherConfig::from_options(&options(&pairs)).unwrap();

        assert_eq!(config.batch_size, 16);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.dimensions, Some(256));
        assert!(config.request_dimensions);
        assert_eq!(config.backoff.base, Duration::from_millis(100));
        assert_eq!(config.backoff.multiplier, 3.0);
        assert_eq!(config.backoff.cap, Duration::from_secs(2));
        assert_eq!(config.rate_limit_rps, NonZeroU32::new(20));
        assert_eq!(config.text_field, "body");
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (key, value) in [
            ("batch_size", "0"),
            ("batch_size", "5000"),
            ("batch_size", "ten"),
            ("concurrency", "0"),
            ("timeout", "0s"),
            ("timeout", "5h"),
            ("max_retries", "-1"),
            ("backoff_multiplier", "0.5"),
            ("rate_limit_rps", "0"),
        ] {
            let mut pairs = required();
            pairs.push((key, value));
            let err = EnricherConfig::from_options(&options(&pairs)).unwrap_err();
            match err {
                ConfigError::Invalid { key: got, .. } => assert_eq!(got, key, "value {}", value),
                other => panic!("expected Invalid for {}={}, got {:?}", key, value, other),
            }
        }
    }

    #[test]
    fn test_bad_url_rejected() {
        let mut pairs = required();
        pairs[0] = ("url", "ftp://example.com/embed");
        let err = EnricherConfig::from_options(&options(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "url"));

        pairs[0] = ("url", "not a url");
        assert!(EnricherConfig::from_options(&options(&pairs)).is_err());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut pairs = required();
        pairs.push(("batchsize", "10"));
        let err = EnricherConfig::from_options(&options(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::Unknown("batchsize".to_string()));
    }

    #[test]
    fn test_unknown_model_has_no_dimension() {
        let config = EnricherConfig::new("http://localhost:8080/embed", "k", "custom-model");
        assert_eq!(config.dimensions, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = EnricherConfig::new("http://localhost/embed", "k", "m")
            .with_batch_size(2)
            .with_concurrency(3)
            .with_timeout(Duration::from_secs(1))
            .with_max_retries(0)
            .with_text_field("content");

        assert_eq!(config.batch_size, 2);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.text_field, "content");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = EnricherConfig::new("http://localhost/embed", "sk-secret", "m");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("t", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("t", "5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("t", "2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("t", "7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("t", "ms").is_err());
    }

    #[test]
    fn test_backoff_calculation() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            cap: Duration::from_millis(500),
        };

        // 100ms, 200ms, 400ms, 500ms (max)
        assert_eq!(backoff.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_retry(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_retry(60), Duration::from_millis(500));
        assert_eq!(backoff.clamp(Duration::from_secs(9)), Duration::from_millis(500));
    }
}
