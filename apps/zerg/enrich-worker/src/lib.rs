//! Enrich Worker
//!
//! A host process for the embedding enricher: newline-delimited JSON
//! records in, the same records with embeddings (or error tags) out.
//!
//! ## Architecture
//!
//! ```text
//! stdin (NDJSON)
//!   ↓ (flushes of ENRICH_FLUSH_SIZE lines)
//! BatchEnricher<HttpEmbeddingClient>
//!   ↓ (sub-batches, bounded concurrency, retries)
//! Embeddings API
//!   ↓
//! stdout (NDJSON, one line per input line, same order)
//! ```
//!
//! ## Environment
//!
//! - `EMBED_URL`, `EMBED_API_KEY`, `EMBED_MODEL` (required)
//! - `EMBED_<OPTION>` for every other enricher option, e.g. `EMBED_BATCH_SIZE`
//! - `ENRICH_FLUSH_SIZE`: input lines per enrich call (default 500)
//! - `APP_ENV`, `RUST_LOG`: logging, see `core_config::tracing`

use core_config::{ConfigError, Environment, FromEnv, env_optional, env_parse_or};
use embed_enricher::{
    BatchEnricher, EmbeddingClient, EnricherConfig, HttpEmbeddingClient, JsonRecord, KNOWN_OPTIONS,
    cancelled,
};
use eyre::{Result, WrapErr};
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const DEFAULT_FLUSH_SIZE: usize = 500;

/// Settings loaded from the environment
#[derive(Clone)]
pub struct WorkerSettings {
    /// Enricher options keyed by option name
    pub options: HashMap<String, String>,
    pub flush_size: usize,
}

/// Environment variable carrying an enricher option
pub fn option_env_var(option: &str) -> String {
    format!("EMBED_{}", option.to_ascii_uppercase())
}

impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let options = KNOWN_OPTIONS
            .iter()
            .filter_map(|&key| env_optional(&option_env_var(key)).map(|v| (key.to_string(), v)))
            .collect();

        let flush_size = env_parse_or("ENRICH_FLUSH_SIZE", DEFAULT_FLUSH_SIZE)?;
        if flush_size == 0 {
            return Err(ConfigError::ParseError {
                key: "ENRICH_FLUSH_SIZE".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            options,
            flush_size,
        })
    }
}

/// Line counts for one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub lines: usize,
    pub invalid: usize,
    pub embedded: usize,
    pub failed: usize,
    pub flushes: usize,
}

enum Slot {
    Record,
    Invalid(Value),
}

/// Lines read since the last flush, in input order
struct Pending {
    error_field: String,
    slots: Vec<Slot>,
    records: Vec<JsonRecord>,
}

impl Pending {
    fn new(error_field: &str) -> Self {
        Self {
            error_field: error_field.to_string(),
            slots: Vec::new(),
            records: Vec::new(),
        }
    }

    fn push(&mut self, line: &str) {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                self.records.push(JsonRecord::new(value));
                self.slots.push(Slot::Record);
            }
            Err(e) => self.push_invalid(line, format!("invalid JSON: {}", e)),
        }
    }

    fn push_invalid(&mut self, raw: &str, reason: String) {
        let mut invalid = json!({ "raw": raw });
        invalid[self.error_field.as_str()] = Value::String(reason);
        self.slots.push(Slot::Invalid(invalid));
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Enrich NDJSON from `reader` into `writer`.
///
/// Every non-blank input line produces exactly one output line, in order.
/// Lines that are not UTF-8 or not JSON are echoed back with an error.
/// A shutdown signal or read failure stops reading; lines already read are
/// still written before a read failure is returned.
pub async fn enrich_stream<C, R, W>(
    enricher: &BatchEnricher<C>,
    mut reader: R,
    mut writer: W,
    flush_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<StreamStats>
where
    C: EmbeddingClient + 'static,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let error_field = enricher.fields().error.clone();
    let mut pending = Pending::new(&error_field);
    let mut stats = StreamStats::default();
    let mut buf = Vec::new();
    let mut read_error = None;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;

            _ = cancelled(&mut shutdown) => {
                info!("Shutdown signal received, no longer reading input");
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to read input, flushing pending records");
                read_error = Some(e);
                break;
            }
        }

        let line = trim_line_ending(&buf);
        match std::str::from_utf8(line) {
            Ok(text) if text.trim().is_empty() => continue,
            Ok(text) => pending.push(text),
            Err(e) => {
                let raw = String::from_utf8_lossy(line);
                pending.push_invalid(&raw, format!("invalid UTF-8: {}", e));
            }
        }

        if pending.len() >= flush_size {
            let batch = std::mem::replace(&mut pending, Pending::new(&error_field));
            flush(enricher, batch, &mut writer, &shutdown, &mut stats).await?;
        }
    }

    if !pending.slots.is_empty() {
        flush(enricher, pending, &mut writer, &shutdown, &mut stats).await?;
    }
    writer.flush().await.wrap_err("Failed to flush output")?;

    if let Some(e) = read_error {
        return Err(e).wrap_err("Failed to read input");
    }

    Ok(stats)
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn flush<C, W>(
    enricher: &BatchEnricher<C>,
    pending: Pending,
    writer: &mut W,
    shutdown: &watch::Receiver<bool>,
    stats: &mut StreamStats,
) -> Result<()>
where
    C: EmbeddingClient + 'static,
    W: AsyncWrite + Unpin,
{
    let Pending { slots, records, .. } = pending;
    let (enriched, summary) = enricher
        .enrich_with_summary(records, shutdown.clone())
        .await;

    stats.flushes += 1;
    stats.lines += slots.len();
    stats.embedded += summary.embedded;
    stats.failed += summary.failed;

    let mut enriched = enriched.into_iter();
    let mut out = String::new();
    for slot in slots {
        let value = match slot {
            Slot::Record => match enriched.next() {
                Some(record) => record.into_inner(),
                None => eyre::bail!("enricher returned fewer records than it was given"),
            },
            Slot::Invalid(value) => {
                stats.invalid += 1;
                value
            }
        };
        out.push_str(&serde_json::to_string(&value).wrap_err("Failed to encode record")?);
        out.push('\n');
    }

    writer
        .write_all(out.as_bytes())
        .await
        .wrap_err("Failed to write output")?;

    debug!(
        lines = stats.lines,
        embedded = summary.embedded,
        failed = summary.failed,
        "Flushed batch"
    );
    Ok(())
}

/// Run the enrich worker
///
/// 1. Sets up structured logging on stderr
/// 2. Loads and validates enricher configuration from the environment
/// 3. Streams stdin through the enricher to stdout until EOF or shutdown
///
/// # Errors
///
/// Returns an error if the configuration is invalid or stdin/stdout fail.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting enrich worker"
    );

    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    let config = EnricherConfig::from_options(&settings.options)
        .wrap_err("Invalid enricher configuration")?;
    info!(config = ?config, flush_size = settings.flush_size, "Configuration loaded");

    let client = HttpEmbeddingClient::new(&config).wrap_err("Failed to build embeddings client")?;
    let enricher =
        BatchEnricher::new(config, client).wrap_err("Failed to initialize batch enricher")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let stats = enrich_stream(&enricher, stdin, stdout, settings.flush_size, shutdown_rx).await?;

    enricher.shutdown();
    info!(
        lines = stats.lines,
        invalid = stats.invalid,
        embedded = stats.embedded,
        failed = stats.failed,
        flushes = stats.flushes,
        "Enrich worker stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => {
            res?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        res = terminate => {
            res?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use embed_enricher::{EmbeddingRequest, EmbeddingResponse, EnrichError};
    use tokio::time::Instant;

    struct LengthClient;

    #[async_trait]
    impl EmbeddingClient for LengthClient {
        async fn embed(
            &self,
            request: &EmbeddingRequest,
            _deadline: Instant,
        ) -> Result<EmbeddingResponse, EnrichError> {
            Ok(EmbeddingResponse {
                vectors: request.input.iter().map(|t| vec![t.len() as f32]).collect(),
            })
        }
    }

    fn enricher() -> BatchEnricher<LengthClient> {
        let config = EnricherConfig::new("http://localhost/v1/embeddings", "sk", "mock")
            .with_batch_size(2);
        BatchEnricher::new(config, LengthClient).unwrap()
    }

    fn output_lines(out: &[u8]) -> Vec<Value> {
        std::str::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_option_env_var_names() {
        assert_eq!(option_env_var("url"), "EMBED_URL");
        assert_eq!(option_env_var("batch_size"), "EMBED_BATCH_SIZE");
        assert_eq!(option_env_var("rate_limit_rps"), "EMBED_RATE_LIMIT_RPS");
    }

    #[test]
    fn test_settings_from_env() {
        temp_env::with_vars(
            [
                ("EMBED_URL", Some("https://api.example.com/v1/embeddings")),
                ("EMBED_API_KEY", Some("sk-test")),
                ("EMBED_MODEL", Some("text-embedding-3-small")),
                ("EMBED_BATCH_SIZE", Some("64")),
                ("EMBED_TIMEOUT", Some(" ")),
                ("ENRICH_FLUSH_SIZE", None),
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                assert_eq!(settings.flush_size, DEFAULT_FLUSH_SIZE);
                assert_eq!(settings.options.get("batch_size").map(String::as_str), Some("64"));
                assert!(!settings.options.contains_key("timeout"));

                let config = EnricherConfig::from_options(&settings.options).unwrap();
                assert_eq!(config.batch_size, 64);
                assert_eq!(config.dimensions, Some(1536));
            },
        );
    }

    #[test]
    fn test_missing_required_env_reported_together() {
        temp_env::with_vars(
            [
                ("EMBED_URL", None::<&str>),
                ("EMBED_API_KEY", None),
                ("EMBED_MODEL", Some("m")),
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                let err = EnricherConfig::from_options(&settings.options).unwrap_err();
                let message = err.to_string();
                assert!(message.contains("url"));
                assert!(message.contains("api_key"));
            },
        );
    }

    #[test]
    fn test_zero_flush_size_rejected() {
        temp_env::with_var("ENRICH_FLUSH_SIZE", Some("0"), || {
            assert!(matches!(
                WorkerSettings::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
    }

    #[tokio::test]
    async fn test_stream_preserves_line_order() {
        let enricher = enricher();
        let (_tx, rx) = watch::channel(false);
        let input = concat!(
            "{\"id\":1,\"text\":\"abc\"}\n",
            "not json\n",
            "\n",
            "{\"id\":2}\n",
            "{\"id\":3,\"text\":\"hello\"}\n",
            "{\"id\":4,\"text\":\"x\"}\n",
        );

        let mut out = Vec::new();
        let stats = enrich_stream(&enricher, input.as_bytes(), &mut out, 2, rx)
            .await
            .unwrap();

        let lines = output_lines(&out);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["embedding"], json!([3.0]));
        assert_eq!(lines[1]["raw"], json!("not json"));
        assert!(lines[1]["error"].as_str().unwrap().starts_with("invalid JSON"));
        assert_eq!(lines[2]["id"], json!(2));
        assert_eq!(lines[2]["error"], json!("missing text field"));
        assert_eq!(lines[3]["embedding"], json!([5.0]));
        assert_eq!(lines[4]["embedding"], json!([1.0]));

        assert_eq!(stats.lines, 5);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.embedded, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.flushes, 3);
    }

    #[tokio::test]
    async fn test_undecodable_line_is_echoed_not_fatal() {
        let enricher = enricher();
        let (_tx, rx) = watch::channel(false);
        let input: &[u8] = b"{\"text\":\"a\"}\n\xff\xfe\n{\"text\":\"bb\"}\r\n";

        let mut out = Vec::new();
        let stats = enrich_stream(&enricher, input, &mut out, 10, rx).await.unwrap();

        let lines = output_lines(&out);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["embedding"], json!([1.0]));
        assert!(lines[1]["error"].as_str().unwrap().starts_with("invalid UTF-8"));
        assert_eq!(lines[1]["raw"], json!("\u{fffd}\u{fffd}"));
        assert_eq!(lines[2]["embedding"], json!([2.0]));
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.embedded, 2);
    }

    #[tokio::test]
    async fn test_read_failure_flushes_before_returning() {
        let enricher = enricher();
        let (_tx, rx) = watch::channel(false);
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"text\":\"abc\"}\n")
            .read_error(std::io::Error::other("disk gone"))
            .build();

        let mut out = Vec::new();
        let err = enrich_stream(&enricher, BufReader::new(reader), &mut out, 10, rx)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("disk gone"));
        let lines = output_lines(&out);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["embedding"], json!([3.0]));
    }

    #[tokio::test]
    async fn test_stream_stops_reading_after_shutdown() {
        let enricher = enricher();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let mut out = Vec::new();
        let stats = enrich_stream(&enricher, "{\"text\":\"a\"}\n".as_bytes(), &mut out, 10, rx)
            .await
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(stats, StreamStats::default());
    }
}
