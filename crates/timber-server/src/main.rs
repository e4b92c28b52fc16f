//! timber-server binary: the centralized log storage service.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use timber_server::{RetentionWorker, ServerConfig, StorageServer};
use timber_store::{SharedStore, SqliteConfig, SqliteStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "timber-server", about = "Centralized log storage service")]
struct Args {
    /// Address the RPC listener binds to.
    #[arg(long, env = "TIMBER_LISTEN_ADDR", default_value = "0.0.0.0:7700")]
    listen_addr: String,

    /// Path to the database file.
    #[arg(long, env = "TIMBER_DB_PATH", default_value = "timber.db")]
    db_path: String,

    /// Days to retain logs; zero disables automatic deletion.
    #[arg(long, env = "TIMBER_RETENTION_DAYS", default_value_t = 0)]
    retention_days: u32,

    /// Seconds between retention cleanup runs.
    #[arg(long, env = "TIMBER_RETENTION_INTERVAL_SECS", default_value_t = 3600)]
    retention_interval_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        listen_addr: args.listen_addr.clone(),
        db_path: args.db_path.clone(),
        retention_days: args.retention_days,
        retention_interval: Duration::from_secs(args.retention_interval_secs),
    };

    let store: SharedStore = match SqliteStore::open(SqliteConfig::new(&config.db_path)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(path = %config.db_path, error = %e, "failed to open database");
            std::process::exit(1);
        }
    };
    info!(path = %config.db_path, "database opened");

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

    if config.retention_enabled() {
        let worker = RetentionWorker::new(Arc::clone(&store), config.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await });
    }

    let server = match StorageServer::bind(&config.listen_addr, Arc::clone(&store)).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.serve(cancel).await {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }

    if let Err(e) = store.close().await {
        error!(error = %e, "failed to close store");
    }
}
