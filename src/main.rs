// ABOUTME: CLI entry point for mpr-exchange
// ABOUTME: Connects both stores, runs one exchange and stops cooperatively on Ctrl+C

use anyhow::Context;
use clap::{CommandFactory, Parser, ValueEnum};
use mpr_exchange::config::ExchangeConfig;
use mpr_exchange::exchange::{
    EventSink, JsonLinesSink, PgDestinationStore, PgSourceReader, RunOutcome, SyncOrchestrator,
    TracingSink,
};
use mpr_exchange::postgres;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventFormat {
    /// Log every exchange event
    Text,
    /// Print every exchange event to stdout as a JSON line
    Json,
}

#[derive(Parser)]
#[command(name = "mpr-exchange")]
#[command(about = "Incremental exchange of reference data and transfer sheets between two PostgreSQL databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Source database connection string
    #[arg(long, env = "MPR_EXCHANGE_SOURCE")]
    source: Option<String>,
    /// Destination database connection string
    #[arg(long, env = "MPR_EXCHANGE_DESTINATION")]
    destination: Option<String>,
    /// Path to exchange.toml (defaults to the user config directory)
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
    /// How exchange events are reported
    #[arg(long = "event-format", value_enum, default_value_t = EventFormat::Text)]
    event_format: EventFormat,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs", default_value_t = false)]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

/// Print usage with a reason and exit without starting a run.
fn usage_error(reason: &str) -> ! {
    eprintln!("error: {}\n", reason);
    eprintln!("{}", Cli::command().render_help());
    std::process::exit(2);
}

/// Non-blank connection string that tokio-postgres can parse.
fn validated_connection(value: Option<String>, flag: &str) -> String {
    let value = match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => usage_error(&format!("the {} connection string is required", flag)),
    };
    if let Err(e) = value.parse::<tokio_postgres::Config>() {
        usage_error(&format!("invalid {} connection string: {}", flag, e));
    }
    value
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log. Logs go to stderr so JSON events own stdout.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let source_url = validated_connection(cli.source, "--source");
    let destination_url = validated_connection(cli.destination, "--destination");

    let config = ExchangeConfig::load(cli.config_path.as_deref())?;
    postgres::init_tls_policy(cli.allow_self_signed_certs);

    tracing::info!(
        "Exchanging from {} to {}",
        postgres::sanitize_url(&source_url),
        postgres::sanitize_url(&destination_url)
    );

    let source_client = postgres::connect(&source_url)
        .await
        .context("Failed to connect to source database")?;
    let destination_client = postgres::connect(&destination_url)
        .await
        .context("Failed to connect to destination database")?;

    let source = PgSourceReader::new(source_client, config.source_options());
    let store = PgDestinationStore::new(destination_client, config.destination.schema.clone());
    let events: Arc<dyn EventSink> = match cli.event_format {
        EventFormat::Text => Arc::new(TracingSink),
        EventFormat::Json => Arc::new(JsonLinesSink),
    };

    let orchestrator = SyncOrchestrator::new(Arc::new(source), Arc::new(store), events);

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, exchange stops after the current entity");
            stop.request_stop();
        }
    });

    let summary = orchestrator.start_exchange().await?;

    let totals = summary.totals();
    tracing::info!(
        "Exchange summary: {} rows read, {} inserted, {} updated, {} soft-deleted, {} rejected, {} skipped entities, {}ms",
        totals.fetched,
        totals.inserted,
        totals.updated,
        totals.soft_deleted,
        totals.rejected,
        summary.skipped.len(),
        summary.duration_ms
    );
    if let RunOutcome::Interrupted { last_entity } = &summary.outcome {
        tracing::warn!("Exchange was interrupted after {}", last_entity);
    }

    Ok(())
}
