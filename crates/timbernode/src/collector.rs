//! The collector orchestrator.
//!
//! Wires discovery → stream manager → batcher → store, applies the
//! namespace policy to lifecycle events, and owns the shutdown
//! sequence: stop the stream manager (closing the output channel so
//! the batcher drains), wait for components under the shutdown
//! timeout, then force a final flush through the store's
//! write-optimizer capability.

use std::sync::Arc;

use timber_store::SharedStore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::batcher::Batcher;
use crate::config::CollectorConfig;
use crate::discovery::PodDiscovery;
use crate::error::{CollectorError, Result};
use crate::kubernetes::KubeLogSource;
use crate::stream::LogSource;
use crate::stream_manager::StreamManager;
use crate::types::{PodEvent, PodEventKind};

/// Watches pods on one node and streams their container logs to
/// storage.
pub struct Collector {
    config: CollectorConfig,
    client: kube::Client,
    source: Arc<dyn LogSource>,
    store: SharedStore,
}

impl Collector {
    /// Creates a collector over the given Kubernetes client and store.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Config`] if the configuration is
    /// invalid.
    pub fn new(client: kube::Client, store: SharedStore, config: CollectorConfig) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn LogSource> = Arc::new(KubeLogSource::new(client.clone()));
        Ok(Self {
            config,
            client,
            source,
            store,
        })
    }

    /// Creates a collector with a custom log source (tests).
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Config`] if the configuration is
    /// invalid.
    pub fn with_source(
        client: kube::Client,
        store: SharedStore,
        config: CollectorConfig,
        source: Arc<dyn LogSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client,
            source,
            store,
        })
    }

    /// Collects logs until `cancel` fires, then drains and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if a component fails fatally at startup.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let manager = Arc::new(StreamManager::new(
            Arc::clone(&self.source),
            self.config.max_concurrent_streams,
            self.config.stream_buffer_size,
            self.config.since_time,
            self.config.stream_idle_timeout,
            cancel.child_token(),
        ));
        let input = manager
            .take_output()
            .ok_or_else(|| CollectorError::Discovery("output channel already taken".into()))?;

        let batcher = Batcher::new(
            Arc::clone(&self.store),
            input,
            self.config.batch_size,
            self.config.batch_timeout,
        );

        let discovery = Arc::new(PodDiscovery::new(
            self.client.clone(),
            self.config.node_name.clone(),
            cancel.child_token(),
        ));
        let mut events = discovery
            .take_events()
            .ok_or_else(|| CollectorError::Discovery("event channel already taken".into()))?;

        let tracker = TaskTracker::new();

        // The batcher must be consuming before any stream produces. Its
        // own token never fires: it exits by draining the closed output
        // channel after the stream manager stops.
        tracker.spawn(batcher.run(CancellationToken::new()));

        {
            let discovery = Arc::clone(&discovery);
            tracker.spawn(async move {
                if let Err(e) = discovery.run().await {
                    error!(error = %e, "pod discovery failed");
                }
            });
        }

        info!(
            node = %self.config.node_name,
            max_streams = self.config.max_concurrent_streams,
            batch_size = self.config.batch_size,
            "collector started"
        );

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle_pod_event(&manager, event).await,
                    None => {
                        warn!("discovery event channel closed");
                        break;
                    }
                },
                () = cancel.cancelled() => break,
            }
        }

        self.shutdown(&manager, &tracker).await;
        Ok(())
    }

    /// Applies the namespace policy and starts or stops the stream.
    async fn handle_pod_event(&self, manager: &StreamManager, event: PodEvent) {
        if !self.config.should_collect(&event.container.namespace) {
            return;
        }

        match event.kind {
            PodEventKind::Started => {
                debug!(container = %event.container, "starting stream");
                if let Err(e) = manager.start_stream(event.container.clone()).await {
                    if !matches!(e, CollectorError::Cancelled) {
                        error!(container = %event.container, error = %e, "failed to start stream");
                    }
                }
            }
            PodEventKind::Stopped => {
                debug!(container = %event.container, "stopping stream");
                manager.stop_stream(&event.container);
            }
        }
    }

    async fn shutdown(&self, manager: &StreamManager, tracker: &TaskTracker) {
        info!("collector shutting down");

        // Stopping the stream manager closes the shared output channel;
        // the batcher drains it and performs its own final flush.
        manager.stop_all().await;

        tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!("collector shutdown timeout, some logs may be lost");
        }

        if let Some(optimizer) = self.store.write_optimizer() {
            if let Err(e) = optimizer.flush().await {
                error!(error = %e, "final flush failed");
            }
        }

        info!("collector shutdown complete");
    }
}
