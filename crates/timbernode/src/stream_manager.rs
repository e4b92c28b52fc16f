//! Bounded-concurrency coordinator for container log streams.
//!
//! The manager owns a mapping from container key to an active stream
//! handle and a counting semaphore capping concurrent streams. Output
//! from every stream flows into one shared channel consumed by the
//! batcher; closing that channel after `stop_all` tells the batcher no
//! more lines will arrive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::{CollectorError, Result};
use crate::parser::Parser;
use crate::stream::{ContainerStream, LogSource, StreamStats};
use crate::types::{ContainerRef, LogLine};

/// A running stream and the token that stops it. Holding the token here
/// (rather than a reference back to the manager) keeps ownership
/// acyclic.
struct StreamHandle {
    cancel: CancellationToken,
    stream: Arc<ContainerStream>,
}

/// Coordinates per-container streams under a concurrency cap.
pub struct StreamManager {
    source: Arc<dyn LogSource>,
    parser: Arc<Parser>,
    output_tx: Mutex<Option<mpsc::Sender<LogLine>>>,
    output_rx: Mutex<Option<mpsc::Receiver<LogLine>>>,
    streams: Arc<Mutex<HashMap<String, StreamHandle>>>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    since_time: Option<DateTime<Utc>>,
    idle_timeout: Duration,
}

impl StreamManager {
    /// Creates a manager capping concurrency at `max_streams`, with a
    /// shared output channel sized `buffer_size * 10`.
    #[must_use]
    pub fn new(
        source: Arc<dyn LogSource>,
        max_streams: usize,
        buffer_size: usize,
        since_time: Option<DateTime<Utc>>,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::channel(buffer_size * 10);
        Self {
            source,
            parser: Arc::new(Parser::new()),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: Mutex::new(Some(output_rx)),
            streams: Arc::new(Mutex::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(max_streams)),
            tracker: TaskTracker::new(),
            cancel,
            since_time,
            idle_timeout,
        }
    }

    /// Takes the receiving end of the shared output channel. The batcher
    /// calls this exactly once.
    #[must_use]
    pub fn take_output(&self) -> Option<mpsc::Receiver<LogLine>> {
        self.output_rx.lock().take()
    }

    /// Begins streaming logs for a container. A no-op if the container
    /// already has a stream. Blocks while the pool is at capacity until
    /// a slot frees up or the manager shuts down.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Cancelled`] if the manager is shutting
    /// down.
    pub async fn start_stream(&self, container: ContainerRef) -> Result<()> {
        let key = container.key();
        if self.streams.lock().contains_key(&key) {
            return Ok(());
        }

        // Fair acquisition: waiters queue in FIFO order.
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| CollectorError::Cancelled)?
            }
            () = self.cancel.cancelled() => return Err(CollectorError::Cancelled),
        };

        let output = self
            .output_tx
            .lock()
            .clone()
            .ok_or(CollectorError::Cancelled)?;

        let stream_cancel = self.cancel.child_token();
        let stream = Arc::new(ContainerStream::new(
            Arc::clone(&self.source),
            container,
            output,
            Arc::clone(&self.parser),
            self.since_time,
            self.idle_timeout,
        ));

        {
            let mut streams = self.streams.lock();
            // Another concurrent start may have won while this one was
            // waiting on the semaphore.
            if streams.contains_key(&key) {
                return Ok(());
            }
            streams.insert(
                key.clone(),
                StreamHandle {
                    cancel: stream_cancel.clone(),
                    stream: Arc::clone(&stream),
                },
            );
        }

        let streams = Arc::clone(&self.streams);
        self.tracker.spawn(async move {
            let result = stream.run(stream_cancel).await;
            match &result {
                Ok(()) => {
                    info!(
                        container = %key,
                        lines_read = stream.stats().lines_read,
                        "stream ended normally"
                    );
                }
                Err(CollectorError::Cancelled) => {}
                Err(e) => {
                    warn!(container = %key, error = %e, "stream ended with error");
                }
            }
            streams.lock().remove(&key);
            drop(permit);
        });

        Ok(())
    }

    /// Stops the stream for a container. Cleanup happens on the
    /// stream's exit path.
    pub fn stop_stream(&self, container: &ContainerRef) {
        if let Some(handle) = self.streams.lock().get(&container.key()) {
            handle.cancel.cancel();
        }
    }

    /// Cancels every stream, waits for all of them to exit, then closes
    /// the shared output channel.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        // All stream-held senders are gone; dropping ours closes the
        // channel and lets the batcher drain out.
        self.output_tx.lock().take();
    }

    /// Returns the number of active streams.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// Returns statistics for all active streams.
    #[must_use]
    pub fn stats(&self) -> Vec<StreamStats> {
        self.streams
            .lock()
            .values()
            .map(|handle| handle.stream.stats())
            .collect()
    }
}
