//! wasmindex CLI — run the ingestion pipeline and inspect its state.
//!
//! # Commands
//! ```
//! wasmindex export --config <path> [--source <path>] [--initial-block <h>]
//! wasmindex status --config <path>
//! wasmindex info
//! ```
//!
//! `export` tails the configured event stream; SIGINT finishes the current
//! line, flushes, and exits 0. Unrecoverable database failures exit
//! non-zero.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use wasmindex_core::config::IndexerConfig;
use wasmindex_core::store::Storage;
use wasmindex_engine::{
    ComputationCache, FormulaRegistry, IngestDriver, NoopSearchIndexer, WasmSource,
};
use wasmindex_core::transform::TransformerRegistry;
use wasmindex_storage::{PostgresOptions, PostgresStorage};
use wasmindex_webhooks::{
    subscriptions_from_config, RetryPolicy, WebhookDeliverer, WebhookDispatcher,
};

mod logging;

/// How often the pending webhook queue is drained while exporting.
const DRAIN_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_LIMIT: i64 = 500;
const DRAIN_CONCURRENCY: usize = 8;

#[derive(Parser)]
#[command(
    name = "wasmindex",
    about = "WASM contract-state indexer and query engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the configured event stream into the database
    Export {
        /// Path to the JSON config file
        #[arg(short, long)]
        config: PathBuf,
        /// Override the configured stream path ("-" = stdin)
        #[arg(long)]
        source: Option<PathBuf>,
        /// Override the resume height
        #[arg(long)]
        initial_block: Option<u64>,
    },

    /// Print the pipeline checkpoints
    Status {
        /// Path to the JSON config file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show build information
    Info,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Export {
            config,
            source,
            initial_block,
        } => cmd_export(config, source, initial_block).await,
        Commands::Status { config } => cmd_status(config).await,
        Commands::Info => {
            cmd_info();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn connect(config: &IndexerConfig) -> Result<Arc<dyn Storage>> {
    let storage = PostgresStorage::connect_with_options(
        &config.db.url,
        PostgresOptions {
            max_connections: config.db.max_connections,
            ..Default::default()
        },
    )
    .await
    .context("connecting to database")?;
    Ok(Arc::new(storage))
}

async fn cmd_export(
    config_path: PathBuf,
    source_override: Option<PathBuf>,
    initial_block: Option<u64>,
) -> Result<()> {
    let mut config = IndexerConfig::from_file(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    if let Some(height) = initial_block {
        config.initial_block_height = Some(height);
    }
    if let Some(path) = source_override {
        config.sources.wasm = Some(path);
    }
    logging::init(&config.log);

    let Some(source_path) = config.sources.wasm.clone() else {
        bail!("no event stream configured (sources.wasm) and no --source given");
    };

    let storage = connect(&config).await?;
    let registry = Arc::new(FormulaRegistry::with_defaults());
    let cache = ComputationCache::new(storage.clone(), registry, config.chain_id.clone());

    let dispatcher = if config.webhooks_enabled && !config.webhooks.is_empty() {
        let subscriptions = subscriptions_from_config(&config.webhooks, config.soketi.as_ref());
        Some(WebhookDispatcher::new(storage.clone(), subscriptions))
    } else {
        None
    };

    let mut driver = IngestDriver::new(
        storage.clone(),
        TransformerRegistry::with_default_rules(),
        cache,
        dispatcher,
        Arc::new(NoopSearchIndexer),
        &config,
    );

    // SIGINT → finish the current line, flush, exit cleanly.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    // Background webhook drain while ingesting.
    let deliverer = if config.webhooks_enabled {
        let deliverer = Arc::new(
            WebhookDeliverer::new(
                storage.clone(),
                config.soketi.as_ref(),
                RetryPolicy::default(),
                Duration::from_secs(10),
            )
            .context("building webhook deliverer")?,
        );
        let mut drain_shutdown = shutdown_rx.clone();
        let background = deliverer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(DRAIN_INTERVAL) => {}
                    _ = drain_shutdown.changed() => break,
                }
                if let Err(e) = background.drain(DRAIN_LIMIT, DRAIN_CONCURRENCY).await {
                    warn!(error = %e, "webhook drain failed");
                }
            }
        });
        Some(deliverer)
    } else {
        None
    };

    let reader = WasmSource::from_path(&source_path)
        .open()
        .await
        .with_context(|| format!("opening event stream {}", source_path.display()))?;

    let stats = driver
        .run(reader, shutdown_rx)
        .await
        .context("ingestion failed")?;

    // Final drain so a short-lived export doesn't strand fresh rows.
    if let Some(deliverer) = deliverer {
        if let Err(e) = deliverer.drain(DRAIN_LIMIT, DRAIN_CONCURRENCY).await {
            warn!(error = %e, "final webhook drain failed");
        }
    }

    println!(
        "exported {} events in {} flushes ({} lines, {} skipped, {} malformed)",
        stats.events_exported, stats.flushes, stats.lines, stats.skipped, stats.malformed
    );
    Ok(())
}

async fn cmd_status(config_path: PathBuf) -> Result<()> {
    let config = IndexerConfig::from_file(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let storage = connect(&config).await?;
    let state = storage.state().await.context("reading state")?;

    println!("last wasm block exported: {}", state.last_wasm_block_height_exported);
    println!("latest block height:      {}", state.latest_block_height);
    println!("latest block time (ms):   {}", state.latest_block_time_unix_ms);
    Ok(())
}

fn cmd_info() {
    println!("wasmindex {}", env!("CARGO_PKG_VERSION"));
    println!("  Default batch size: 5000 events/flush");
    println!("  Storage backends: memory, PostgreSQL");
    println!("  Webhook endpoints: HTTP, Soketi (Pusher protocol)");
}
