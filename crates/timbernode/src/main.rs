//! timbernode binary: per-node log collector agent.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser as ClapParser;
use timber_store::{RemoteStore, SharedStore, SqliteConfig, SqliteStore};
use timbernode::{Collector, CollectorConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, ClapParser)]
#[command(name = "timbernode", about = "Per-node Kubernetes container log collector")]
struct Args {
    /// Node whose pods are collected.
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Storage service URL (e.g. ws://timber-server:7700). When unset,
    /// logs are written to an embedded local database.
    #[arg(long, env = "TIMBER_SERVER")]
    server: Option<String>,

    /// Embedded database path, used when no server is configured.
    #[arg(long, env = "TIMBER_DB_PATH", default_value = "timber.db")]
    db_path: String,

    /// Maximum concurrent log streams.
    #[arg(long, env = "TIMBER_MAX_STREAMS", default_value_t = 100)]
    max_streams: usize,

    /// Entries per storage write.
    #[arg(long, env = "TIMBER_BATCH_SIZE", default_value_t = 500)]
    batch_size: usize,

    /// Seconds between forced flushes.
    #[arg(long, env = "TIMBER_BATCH_TIMEOUT_SECS", default_value_t = 5)]
    batch_timeout_secs: u64,

    /// Per-stream buffer size.
    #[arg(long, env = "TIMBER_STREAM_BUFFER", default_value_t = 1000)]
    stream_buffer: usize,

    /// Collect logs from this many minutes back on startup.
    #[arg(long, env = "TIMBER_SINCE_MINUTES", default_value_t = 15)]
    since_minutes: i64,

    /// Comma-separated namespaces to skip.
    #[arg(long, env = "TIMBER_EXCLUDE_NS", default_value = "kube-system", value_delimiter = ',')]
    exclude_namespaces: Vec<String>,

    /// Comma-separated namespaces to collect; empty means all.
    #[arg(long, env = "TIMBER_INCLUDE_NS", value_delimiter = ',')]
    include_namespaces: Vec<String>,

    /// Seconds allowed for draining at shutdown.
    #[arg(long, env = "TIMBER_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,

    /// Seconds without a line before a stream reconnects.
    #[arg(long, env = "TIMBER_STREAM_IDLE_SECS", default_value_t = 300)]
    stream_idle_secs: u64,
}

impl Args {
    fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            node_name: self.node_name.clone(),
            max_concurrent_streams: self.max_streams,
            batch_size: self.batch_size,
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            stream_buffer_size: self.stream_buffer,
            since_time: (self.since_minutes > 0)
                .then(|| chrono::Utc::now() - chrono::Duration::minutes(self.since_minutes)),
            exclude_namespaces: self.exclude_namespaces.clone(),
            include_namespaces: self.include_namespaces.clone(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            stream_idle_timeout: Duration::from_secs(self.stream_idle_secs),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store: SharedStore = match &args.server {
        Some(url) => {
            info!(url = %url, "using remote storage");
            Arc::new(RemoteStore::connect(url.clone()))
        }
        None => {
            info!(path = %args.db_path, "using embedded storage");
            match SqliteStore::open(SqliteConfig::new(&args.db_path)) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!(path = %args.db_path, error = %e, "failed to open database");
                    std::process::exit(1);
                }
            }
        }
    };

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to create kubernetes client");
            std::process::exit(1);
        }
    };

    let collector = match Collector::new(client, Arc::clone(&store), args.collector_config()) {
        Ok(collector) => collector,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    if let Err(e) = collector.run(cancel).await {
        error!(error = %e, "collector failed");
        std::process::exit(1);
    }

    if let Err(e) = store.close().await {
        error!(error = %e, "failed to close store");
    }
}
