//! # duet-replay
//!
//! Replays a file of wire operations against a document snapshot through the
//! full synchronization pipeline, then prints the session status, counters
//! and a consistency report as JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use duet_core::DiagramDocument;
use duet_sync::{parse_wire, CollabSession, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "duet-replay", version, about = "Replay wire operations against a diagram snapshot")]
struct CliArgs {
    /// Diagram snapshot (JSON).
    #[arg(long, env = "DUET_DOCUMENT")]
    document: PathBuf,

    /// Wire operations (JSON object or array).
    #[arg(long, env = "DUET_OPS")]
    ops: PathBuf,

    /// Session configuration (JSON); `DUET_*` environment variables otherwise.
    #[arg(long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Route operations through the sync queue instead of applying them immediately.
    #[arg(long)]
    queued: bool,

    /// Virtual time to run after the last operation (ms).
    #[arg(long, default_value_t = 6_000)]
    settle_ms: u64,

    /// Print the resulting document as well.
    #[arg(long)]
    print_document: bool,
}

/// Initialize structured tracing with optional JSON format.
///
/// Set `RUST_LOG` to control log levels (default: info,duet_sync=debug).
/// Set `RUST_LOG_FORMAT=json` for JSON output.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,duet_sync=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::from_env(),
    };
    config.validate().context("invalid configuration")?;

    let document_json = std::fs::read_to_string(&args.document)
        .with_context(|| format!("reading document {}", args.document.display()))?;
    let host = DiagramDocument::from_json(&document_json)
        .context("parsing document")?
        .into_host()
        .context("building scene")?;

    let ops_json = std::fs::read_to_string(&args.ops)
        .with_context(|| format!("reading operations {}", args.ops.display()))?;
    let operations = parse_wire(&ops_json).context("parsing operations")?;
    tracing::info!(operations = operations.len(), queued = args.queued, "replaying");

    let mut session = CollabSession::new(host, config);
    session.start();
    if args.queued {
        for op in operations {
            session.queue_sync(op);
        }
    } else {
        let report = session.apply_remote_changes(&operations);
        tracing::info!(
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            deferred = report.deferred.len(),
            "remote operations applied"
        );
    }
    session.advance_by(Duration::from_millis(args.settle_ms));

    let echoes = session.take_outbound();
    if !echoes.is_empty() {
        tracing::warn!(count = echoes.len(), "replay produced outbound operations");
    }

    let output = serde_json::json!({
        "status": session.status(),
        "stats": session.stats(),
        "issues": session.validate_sync(),
        "outbound": echoes,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if args.print_document {
        let snapshot = DiagramDocument::from_host(session.host());
        println!("{}", snapshot.to_json()?);
    }

    session.destroy();
    Ok(())
}
