//! Segstore CLI - Admin Command Line Interface
//!
//! This binary inspects and repairs the local cache, the durable logs and
//! the remote segment store of a segstore data directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use segstore_common::{Config, SegmentKind, SegmentName};
use segstore_storage::{CacheManager, DurableLog, ObjectStore, RedoAction};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "segstore-cli")]
#[command(about = "Segstore Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SEGSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory, overrides the configuration file
    #[arg(short, long, env = "SEGSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Local segment cache operations
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
    /// Redo log operations
    Redo {
        #[command(subcommand)]
        action: RedoCommands,
    },
    /// Segmented write-ahead log operations
    Wal {
        #[command(subcommand)]
        action: WalCommands,
    },
    /// Remote segment store operations
    Store {
        #[command(subcommand)]
        action: StoreCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Register cached files found on disk and show the cache size
    Scan {
        /// Run an eviction pass afterwards
        #[arg(long)]
        reconcile: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RedoCommands {
    /// Print the value stored under a key
    Get {
        /// Index name
        index: String,
        key: u64,
    },
    /// Store a value (at most 64 bytes) under a key
    Put {
        /// Index name
        index: String,
        key: u64,
        value: String,
    },
    /// Print every key and value
    Dump {
        /// Index name
        index: String,
    },
}

#[derive(Subcommand, Debug)]
enum WalCommands {
    /// Show entry range and consumer checkpoints
    Info {
        /// Index name
        index: String,
    },
    /// Print one entry
    Read {
        /// Index name
        index: String,
        sequence: u64,
    },
    /// Drop every entry before a sequence number
    Truncate {
        /// Index name
        index: String,
        sequence: u64,
    },
}

#[derive(Subcommand, Debug)]
enum StoreCommands {
    /// List remote segment ids
    List {
        /// Index name
        index: String,
        /// Segment kind (seg or snp)
        #[arg(short, long, default_value = "seg")]
        kind: SegmentKind,
    },
    /// Show remote object count and size
    Stats {
        /// Index name
        index: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download a segment into the local cache
    Fetch {
        /// Index name
        index: String,
        kind: SegmentKind,
        id: u64,
        /// Also copy the segment to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

/// Format bytes as a human-readable size string.
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Show a value as text when it is printable, hex otherwise
fn format_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) if !text.chars().any(char::is_control) => format!("{text:?}"),
        _ => value.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(data_dir) = &args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn open_store(config: &Config, index: &str) -> Result<ObjectStore> {
    let backend = segstore_storage::connect(&config.remote).await?;
    let cache = CacheManager::new(&config.storage);
    cache.rebuild()?;
    Ok(ObjectStore::new(backend, Arc::new(cache), index))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let data_dir = config.storage.data_dir.clone();
    info!("Using data directory {}", data_dir.display());

    match args.command {
        Commands::Cache { action } => match action {
            CacheCommands::Scan { reconcile } => {
                let cache = CacheManager::new(&config.storage);
                let found = cache.rebuild()?;
                println!("Cache Scan");
                println!("==========");
                println!("Root:    {}", cache.root().display());
                println!("Files:   {}", found);
                println!("Size:    {}", format_size(cache.total_size()));
                println!("Target:  {}", format_size(cache.target_size()));

                if reconcile {
                    let report = cache.reconcile();
                    println!();
                    println!("Evicted: {} files", report.evicted);
                    println!(
                        "Size:    {} -> {}",
                        format_size(report.total_before),
                        format_size(report.total_after)
                    );
                }
            }
        },
        Commands::Redo { action } => match action {
            RedoCommands::Get { index, key } => {
                let log = DurableLog::open_existing(&data_dir, &index, &config.wal)?;
                let redo = log.redo();
                let value = redo.read(key)?;
                println!("{}", format_value(&value));
            }
            RedoCommands::Put { index, key, value } => {
                let log = DurableLog::open_existing(&data_dir, &index, &config.wal)?;
                let redo = log.redo();
                redo.write(key, value.as_bytes())?;
                log.close()?;
                println!("Stored {} bytes under key {}", value.len(), key);
            }
            RedoCommands::Dump { index } => {
                let log = DurableLog::open_existing(&data_dir, &index, &config.wal)?;
                let redo = log.redo();
                let entries = redo.entries()?;
                if entries.is_empty() {
                    println!("No redo entries");
                } else {
                    println!("{:<20} VALUE", "KEY");
                    for (key, value) in entries {
                        println!("{:<20} {}", key, format_value(&value));
                    }
                }
            }
        },
        Commands::Wal { action } => match action {
            WalCommands::Info { index } => {
                let log = DurableLog::open_existing(&data_dir, &index, &config.wal)?;
                println!("Log: {}", index);
                println!("=====");
                println!("Entries:     {}", log.len());
                println!("First index: {}", log.first_index());
                println!("Last index:  {}", log.last_index());
                for action in RedoAction::ALL {
                    match log.checkpoint(action)? {
                        Some(range) => println!("Checkpoint {:<9} {}", action, range),
                        None => println!("Checkpoint {:<9} -", action),
                    }
                }
                log.close()?;
            }
            WalCommands::Read { index, sequence } => {
                let log = DurableLog::open_existing(&data_dir, &index, &config.wal)?;
                let entry = log.read(sequence)?;
                println!("{}", format_value(&entry));
                log.close()?;
            }
            WalCommands::Truncate { index, sequence } => {
                let log = DurableLog::open_existing(&data_dir, &index, &config.wal)?;
                log.truncate_front(sequence)?;
                println!(
                    "Log {} now holds entries {}..={}",
                    index,
                    log.first_index(),
                    log.last_index()
                );
                log.close()?;
            }
        },
        Commands::Store { action } => match action {
            StoreCommands::List { index, kind } => {
                let store = open_store(&config, &index).await?;
                let ids = store.list(kind).await?;
                if ids.is_empty() {
                    println!("No {} files", kind);
                } else {
                    for id in ids {
                        println!("{}", SegmentName::new(kind, id).file_name());
                    }
                }
            }
            StoreCommands::Stats { index, json } => {
                let store = open_store(&config, &index).await?;
                let (count, bytes) = store.stats().await;
                if json {
                    let stats = serde_json::json!({
                        "index": index,
                        "objects": count,
                        "bytes": bytes,
                    });
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    println!("Index:   {}", index);
                    println!("Objects: {}", count);
                    println!("Size:    {}", format_size(bytes));
                }
            }
            StoreCommands::Fetch { index, kind, id, out } => {
                let store = open_store(&config, &index).await?;
                store.setup(false).await?;
                let segment = store.load(kind, id).await?;
                println!(
                    "Cached {} ({})",
                    segment.path().display(),
                    format_size(segment.len() as u64)
                );
                if let Some(out) = out {
                    std::fs::write(&out, &*segment)
                        .with_context(|| format!("writing {}", out.display()))?;
                    println!("Copied to {}", out.display());
                }
            }
        },
    }

    Ok(())
}
