//! Enrich Worker - Entry Point
//!
//! Reads NDJSON records on stdin and writes them, embedded, to stdout.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_enrich_worker::run().await
}
