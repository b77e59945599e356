//! Durable Telemetry Exporter Binary

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry_exporter::{
    Config, EnvelopeKind, ExporterError, ItemBuffer, ListenerChain, LocalSpool, Result,
    SendResult, StatsListener, TelemetryItem, TelemetryItemExporter,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "telemetry-exporter", version, about = "Durable telemetry export pipeline")]
struct Cli {
    /// Ingestion endpoint, overrides EXPORTER_ENDPOINT
    #[arg(long, env = "EXPORTER_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Spool directory, overrides SPOOL_DIR
    #[arg(long, env = "SPOOL_DIR", global = true)]
    spool_dir: Option<PathBuf>,

    /// Disable the on-disk spool
    #[arg(long, global = true)]
    no_spool: bool,

    /// Seconds to wait for in-flight sends on shutdown
    #[arg(long, default_value_t = 30, global = true)]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send JSON lines from a file or stdin
    Send {
        /// Input file, `-` for stdin
        #[arg(long, default_value = "-")]
        input: String,

        /// Envelope kind for every item
        #[arg(long, default_value = "Log")]
        kind: String,

        /// Routing key (instrumentation key) stamped on every item
        #[arg(long, env = "EXPORTER_ROUTING_KEY", default_value = "")]
        routing_key: String,
    },
    /// Resend spooled batches until the spool is empty or a resend fails
    Drain,
    /// Print spool contents
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing()?;

    info!("Starting telemetry exporter v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = load_config(&cli);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Exporter configuration - Endpoint: {}, Spool: {} ({} bytes max)",
        config.endpoint,
        config.spool_dir.display(),
        config.max_spool_bytes
    );

    let shutdown_timeout = Duration::from_secs(cli.shutdown_timeout);

    match cli.command {
        Command::Send {
            input,
            kind,
            routing_key,
        } => {
            let kind = EnvelopeKind::from(kind.as_str());
            run_send(&config, &input, kind, &routing_key, shutdown_timeout).await
        }
        Command::Drain => run_drain(&config, shutdown_timeout).await,
        Command::Status => run_status(&config).await,
    }
}

fn load_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();

    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(dir) = &cli.spool_dir {
        config.spool_dir = dir.clone();
    }
    if cli.no_spool {
        config.spool_enabled = false;
    }

    config
}

async fn open_input(input: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    if input == "-" {
        Ok(Box::new(tokio::io::stdin()))
    } else {
        Ok(Box::new(tokio::fs::File::open(input).await?))
    }
}

async fn run_send(
    config: &Config,
    input: &str,
    kind: EnvelopeKind,
    routing_key: &str,
    shutdown_timeout: Duration,
) -> Result<()> {
    let stats = Arc::new(StatsListener::new());
    let exporter =
        TelemetryItemExporter::from_config(config, ListenerChain::new().with(stats.clone()))
            .await?;
    let buffer = ItemBuffer::new(config.buffer_max_items, config.batch_limits());

    let mut lines = BufReader::new(open_input(input).await?).lines();
    let mut pending = Vec::new();
    let mut skipped = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let data: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Skipping line that is not JSON: {}", e);
                skipped += 1;
                continue;
            }
        };

        buffer
            .add_item(TelemetryItem::from_json(kind, routing_key, &data)?)
            .await;

        if buffer.should_flush().await {
            if let Some(batch) = buffer.drain_batch().await? {
                pending.push(exporter.send_detached(batch));
            }
        }
    }

    for batch in buffer.flush_all().await? {
        pending.push(exporter.send_detached(batch));
    }

    let flushed = exporter.shutdown(Some(shutdown_timeout)).await;

    let (mut delivered, mut spooled, mut dropped, mut stopped) = (0u64, 0u64, 0u64, 0u64);
    for handle in pending {
        match handle
            .await
            .map_err(|e| ExporterError::Other(format!("send task failed: {}", e)))?
        {
            SendResult::Delivered => delivered += 1,
            SendResult::Spooled => spooled += 1,
            SendResult::Dropped(_) => dropped += 1,
            SendResult::Stopped => stopped += 1,
        }
    }

    let report = json!({
        "flush": flushed,
        "batches": {
            "delivered": delivered,
            "spooled": spooled,
            "dropped": dropped,
            "stopped": stopped,
        },
        "delivery": stats.snapshot(),
        "skipped_lines": skipped,
        "buffer_dropped": buffer.dropped(),
        "spool": exporter.spool().map(|spool| spool.stats()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

async fn run_drain(config: &Config, shutdown_timeout: Duration) -> Result<()> {
    if !config.spool_enabled {
        return Err(ExporterError::Config(
            "drain needs the spool to be enabled".to_string(),
        ));
    }

    let exporter = TelemetryItemExporter::from_config(config, ListenerChain::new()).await?;
    let report = exporter.resend_spooled(u64::MAX).await;
    let flushed = exporter.shutdown(Some(shutdown_timeout)).await;

    let remaining = match exporter.spool() {
        Some(spool) => spool.entries().await?.len(),
        None => 0,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "flush": flushed,
            "sweep": report,
            "remaining_entries": remaining,
        }))?
    );

    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let spool = LocalSpool::open(&config.spool_dir, config.max_spool_bytes).await?;
    let entries = spool.entries().await?;

    let listing: Vec<_> = entries
        .iter()
        .map(|entry| {
            json!({
                "id": entry.id,
                "size": entry.size,
                "written_at": chrono::DateTime::<chrono::Utc>::from(entry.written_at),
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "dir": spool.dir(),
            "capacity": spool.capacity(),
            "resident_bytes": spool.resident_bytes().await?,
            "entries": listing,
        }))?
    );

    Ok(())
}

/// Initialize structured logging on stderr so reports on stdout stay parseable
fn initialize_tracing() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .map_err(|e| ExporterError::Config(format!("invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ExporterError::Other(format!("failed to install tracing: {}", e)))
}
