//! Storage service configuration.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Configuration for the storage service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the RPC listener binds to.
    pub listen_addr: String,
    /// Path to the database file.
    pub db_path: String,
    /// Days to retain logs. Zero disables automatic deletion.
    pub retention_days: u32,
    /// How often the retention cleanup runs.
    pub retention_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7700".to_string(),
            db_path: "timber.db".to_string(),
            retention_days: 0,
            retention_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl ServerConfig {
    /// Returns true if log retention is configured.
    #[must_use]
    pub const fn retention_enabled(&self) -> bool {
        self.retention_days > 0
    }

    /// Returns the instant before which logs should be deleted.
    #[must_use]
    pub fn retention_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(24 * i64::from(self.retention_days))
    }
}
