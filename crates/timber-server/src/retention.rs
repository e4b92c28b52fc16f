//! Periodic deletion of entries past the retention window.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use timber_store::SharedStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServerConfig;

/// A point-in-time snapshot of retention statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionStats {
    /// Cleanup cycles executed.
    pub total_runs: u64,
    /// Entries deleted across all runs.
    pub total_deleted: i64,
}

/// Deletes entries older than `retention_days`, immediately on startup
/// and then on every `retention_interval` tick.
pub struct RetentionWorker {
    store: SharedStore,
    config: ServerConfig,
    total_runs: AtomicU64,
    total_deleted: AtomicI64,
}

impl RetentionWorker {
    /// Creates a retention worker over the given store.
    #[must_use]
    pub fn new(store: SharedStore, config: ServerConfig) -> Self {
        Self {
            store,
            config,
            total_runs: AtomicU64::new(0),
            total_deleted: AtomicI64::new(0),
        }
    }

    /// Returns a snapshot of the worker's counters.
    #[must_use]
    pub fn stats(&self) -> RetentionStats {
        RetentionStats {
            total_runs: self.total_runs.load(Ordering::Relaxed),
            total_deleted: self.total_deleted.load(Ordering::Relaxed),
        }
    }

    /// Runs cleanup cycles until cancelled. Returns immediately when
    /// retention is disabled.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.retention_enabled() {
            info!("retention disabled, worker not starting");
            return;
        }

        info!(
            retention_days = self.config.retention_days,
            interval = ?self.config.retention_interval,
            "retention worker starting"
        );

        // First cycle runs immediately.
        self.run_once().await;

        let mut ticker = tokio::time::interval(self.config.retention_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once().await,
                () = cancel.cancelled() => {
                    info!("retention worker stopping");
                    return;
                }
            }
        }
    }

    /// Executes a single retention cycle.
    async fn run_once(&self) {
        let cutoff = self.config.retention_cutoff();
        debug!(cutoff = %cutoff.to_rfc3339(), "retention cleanup starting");

        self.total_runs.fetch_add(1, Ordering::Relaxed);

        match self.store.delete_older_than(cutoff).await {
            Ok(deleted) => {
                self.total_deleted.fetch_add(deleted as i64, Ordering::Relaxed);
                if deleted > 0 {
                    info!(deleted, cutoff = %cutoff.to_rfc3339(), "retention cleanup completed");
                } else {
                    debug!(cutoff = %cutoff.to_rfc3339(), "retention cleanup completed, nothing to delete");
                }
            }
            Err(e) => {
                error!(cutoff = %cutoff.to_rfc3339(), error = %e, "retention cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use timber_proto::{LogEntry, Query, QueryResult, StoreStats};
    use timber_store::{Result as StoreResult, Store, StoreError};

    struct DeleteCountingStore {
        cutoffs: Mutex<Vec<DateTime<Utc>>>,
        per_run: u64,
    }

    #[async_trait]
    impl Store for DeleteCountingStore {
        async fn write(&self, _entries: Vec<LogEntry>) -> StoreResult<usize> {
            Ok(0)
        }

        async fn query(&self, _query: Query) -> StoreResult<QueryResult> {
            Ok(QueryResult::default())
        }

        async fn get_by_id(&self, _id: i64) -> StoreResult<LogEntry> {
            Err(StoreError::NotFound)
        }

        async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
            self.cutoffs.lock().push(cutoff);
            Ok(self.per_run)
        }

        async fn stats(&self) -> StoreResult<StoreStats> {
            Ok(StoreStats::default())
        }

        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    fn worker(days: u32, interval: Duration, per_run: u64) -> (RetentionWorker, Arc<DeleteCountingStore>) {
        let store = Arc::new(DeleteCountingStore {
            cutoffs: Mutex::new(Vec::new()),
            per_run,
        });
        let config = ServerConfig {
            retention_days: days,
            retention_interval: interval,
            ..Default::default()
        };
        (RetentionWorker::new(Arc::clone(&store) as Arc<dyn Store>, config), store)
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_retention_never_deletes() {
        let (worker, store) = worker(0, Duration::from_secs(60), 1);
        worker.run(CancellationToken::new()).await;

        assert!(store.cutoffs.lock().is_empty());
        assert_eq!(worker.stats(), RetentionStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_on_ticker() {
        let (worker, store) = worker(7, Duration::from_secs(60), 3);
        let worker = Arc::new(worker);
        let cancel = CancellationToken::new();

        let handle = {
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };

        // Immediate run plus two ticker cycles.
        tokio::time::sleep(Duration::from_secs(125)).await;
        cancel.cancel();
        handle.await.expect("worker task");

        let runs = store.cutoffs.lock().len();
        assert_eq!(runs, 3, "one immediate run and two ticks");

        let stats = worker.stats();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.total_deleted, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn cutoff_is_retention_days_back() {
        let (worker, store) = worker(2, Duration::from_secs(3600), 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // One immediate run happens even when cancelled right after.
        worker.run_once().await;
        let cutoff = store.cutoffs.lock()[0];
        let expected = Utc::now() - chrono::Duration::days(2);
        assert!((cutoff - expected).num_seconds().abs() < 5);
    }
}
