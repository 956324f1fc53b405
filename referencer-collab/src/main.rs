//! Collaboration room server binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory rooms on the default port
//! referencer-collab --in-memory
//!
//! # Durable rooms
//! referencer-collab --host 127.0.0.1 --port 4444 --db-dir ./data/yjs-docs
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use referencer_collab::{RoomConfig, ServerConfig, SyncServer};

/// Real-time collaboration server for Yjs clients
#[derive(Parser, Debug)]
#[command(name = "referencer-collab")]
#[command(about = "Room-based CRDT sync server with editor/viewer roles")]
#[command(version)]
struct Args {
    /// Interface to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 4444)]
    port: u16,

    /// RocksDB directory for room snapshots
    #[arg(long, env = "DB_DIR", default_value = "./data/yjs-docs")]
    db_dir: PathBuf,

    /// Keep documents in memory only
    #[arg(long, env = "IN_MEMORY")]
    in_memory: bool,

    /// Quiet period before a changed room is persisted
    #[arg(long, env = "DEBOUNCE_MS", default_value_t = 1000)]
    debounce_ms: u64,

    /// How long an empty room stays loaded
    #[arg(long, env = "IDLE_EVICTION_SECS", default_value_t = 30)]
    idle_eviction_secs: u64,

    /// Frames buffered per connection before it is dropped as stalled
    #[arg(long, env = "OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        storage_path: (!args.in_memory).then_some(args.db_dir),
        room: RoomConfig {
            outbound_capacity: args.outbound_capacity,
            persist_debounce: Duration::from_millis(args.debounce_ms),
            idle_eviction: Duration::from_secs(args.idle_eviction_secs),
            ..RoomConfig::default()
        },
    };
    if let Some(path) = &config.storage_path {
        log::info!("Persisting rooms to {}", path.display());
    }

    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, flushing rooms");
        }
    }
    server.shutdown().await;
    log::info!("Shutdown complete");

    Ok(())
}
