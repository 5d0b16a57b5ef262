//! WolfSync - Live Table Mirror
//!
//! Command line front end: config scaffolding plus an in-process demo
//! of coalesced editing between two sessions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::broadcast::BroadcastHub;
use wolfsync::config::{StoreConfig, WolfSyncConfig};
use wolfsync::error::Result;
use wolfsync::remote::MemoryRemote;
use wolfsync::row::{Row, Value};
use wolfsync::SyncStore;

/// WolfSync - Live Table Mirror
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,

        /// Table to mirror
        #[arg(long, default_value = "todos")]
        table: String,

        /// Coalescing window in milliseconds
        #[arg(long)]
        mutate_interval_ms: Option<u64>,
    },

    /// Validate configuration file
    Validate,

    /// Run two in-memory sessions editing the same row
    Demo {
        /// Number of rapid edits to make
        #[arg(short, long, default_value_t = 20)]
        edits: usize,

        /// Coalescing window in milliseconds
        #[arg(long, default_value_t = 1000)]
        mutate_interval_ms: u64,

        /// Delay between edits in milliseconds
        #[arg(long, default_value_t = 50)]
        pace_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Init {
            output,
            table,
            mutate_interval_ms,
        } => run_init(output, table, mutate_interval_ms),
        Commands::Validate => run_validate(cli.config),
        Commands::Demo {
            edits,
            mutate_interval_ms,
            pace_ms,
        } => run_demo(edits, mutate_interval_ms, pace_ms).await,
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Write a default configuration file
fn run_init(output: PathBuf, table: String, mutate_interval_ms: Option<u64>) -> Result<()> {
    let mut store = StoreConfig::new(table);
    store.mutate_interval_ms = mutate_interval_ms;
    let config = WolfSyncConfig::new(store);
    config.validate()?;

    let content = format!(
        "# WolfSync Configuration\n# Generated {}\n\n{}",
        chrono::Utc::now().to_rfc3339(),
        config.to_toml()?
    );
    std::fs::write(&output, content)?;

    println!("Configuration written to {:?}", output);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Table: {}", config.store.table);
            println!("  Index: {}", config.store.index_name);
            match config.store.mutate_interval_ms {
                Some(ms) => println!("  Mutate Interval: {} ms", ms),
                None => println!("  Mutate Interval: disabled (write-through)"),
            }
            println!(
                "  Broadcast: event={}, attempts={}, delay={} ms",
                config.broadcast.event,
                config.broadcast.retry_attempts,
                config.broadcast.retry_delay_ms
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Two sessions over one in-memory table and relay
async fn run_demo(edits: usize, mutate_interval_ms: u64, pace_ms: u64) -> Result<()> {
    let started = chrono::Utc::now();
    let config = WolfSyncConfig::new(StoreConfig::new("todos").with_mutate_interval(mutate_interval_ms));

    let remote = Arc::new(MemoryRemote::new(config.store.index_name.clone()));
    remote
        .seed(
            &config.store.table,
            vec![Row::new().with("id", 1).with("text", "").with("done", false)],
        )
        .await;
    let hub = Arc::new(BroadcastHub::new());

    let session = |name: &'static str| {
        SyncStore::new(
            &config,
            remote.clone(),
            Arc::new(remote.feed(&config.store.table)),
            Some(Arc::new(hub.channel())),
            Some(Box::new(move || tracing::info!("Session {} ready", name))),
        )
    };
    let writer = session("writer")?;
    let reader = session("reader")?;

    for store in [&writer, &reader] {
        store.load().await?;
        store
            .subscribe(Arc::new(|rows: &[Row]| {
                tracing::debug!("Snapshot now holds {} rows", rows.len());
            }))
            .await?;
    }

    // Let both sessions finish joining
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut text = String::new();
    for i in 0..edits {
        text.push(char::from(b'a' + (i % 26) as u8));
        writer
            .mutate(&Value::from(1), Row::new().with("text", text.clone()))
            .await?;
        tokio::time::sleep(Duration::from_millis(pace_ms)).await;
    }

    let before = remote.updates().await.len();
    let pending = writer.pending_keys().await;
    let mirrored = reader
        .get(&Value::from(1))
        .await?
        .and_then(|row| row.get("text").cloned());

    writer.shutdown().await?;
    reader.shutdown().await?;
    let after = remote.updates().await.len();

    println!("WolfSync Demo");
    println!("=============");
    println!();
    println!("Edits made:          {}", edits);
    println!("Mutate interval:     {} ms", mutate_interval_ms);
    println!("Remote updates:      {} before teardown, {} after", before, after);
    println!("Pending at teardown: {:?}", pending);
    println!("Reader saw text:     {:?}", mirrored);
    println!("Remote row:          {:?}", remote.rows(&config.store.table).await);
    println!(
        "Elapsed:             {} ms",
        (chrono::Utc::now() - started).num_milliseconds()
    );

    Ok(())
}
