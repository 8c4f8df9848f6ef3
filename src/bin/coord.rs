//! Coordinator binary

use clap::{Parser, Subcommand};
use minizero::common::{parse_duration, Config, StorageBackend};
use minizero::Coordinator;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minizero-coord")]
#[command(about = "minizero cluster membership coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Raft id of this coordinator
        #[arg(long)]
        id: Option<u64>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Address other nodes use to reach this coordinator
        #[arg(long)]
        advertise: Option<String>,

        /// Data directory for persistent backends
        #[arg(long)]
        db: Option<PathBuf>,

        /// memory, sled or rocksdb
        #[arg(long)]
        storage: Option<String>,

        /// Members per group
        #[arg(long)]
        replicas: Option<usize>,

        /// Membership stream interval (e.g. "1s", "500ms")
        #[arg(long)]
        stream_interval: Option<String>,

        /// Rebalance interval, "0s" disables (e.g. "8m")
        #[arg(long)]
        rebalance_interval: Option<String>,
    },
}

fn parse_storage(s: &str) -> anyhow::Result<StorageBackend> {
    match s.to_ascii_lowercase().as_str() {
        "memory" => Ok(StorageBackend::Memory),
        "sled" => Ok(StorageBackend::Sled),
        "rocksdb" => Ok(StorageBackend::Rocksdb),
        other => anyhow::bail!("unknown storage backend: {}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // File and environment first; CLI flags override.
    let config = Config::load();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            advertise,
            db,
            storage,
            replicas,
            stream_interval,
            rebalance_interval,
        } => {
            let mut coord = config.coordinator;
            if let Some(id) = id {
                coord.node_id = id;
            }
            if let Some(bind) = bind {
                coord.bind_addr = bind;
            }
            if let Some(advertise) = advertise {
                coord.advertise_addr = advertise;
            }
            if let Some(db) = db {
                coord.db_path = db;
            }
            if let Some(storage) = storage {
                coord.storage = parse_storage(&storage)?;
            }
            if let Some(replicas) = replicas {
                coord.replicas = replicas;
            }
            if let Some(interval) = stream_interval {
                coord.stream_interval_ms = parse_duration(&interval)?.as_millis() as u64;
            }
            if let Some(interval) = rebalance_interval {
                coord.rebalance_interval_secs = parse_duration(&interval)?.as_secs();
            }

            Coordinator::new(coord).serve().await?;
        }
    }

    Ok(())
}
