//! Accumulates log lines and commits them to storage in bursts.
//!
//! A flush happens when the buffer reaches `batch_size` or when
//! `batch_timeout` has elapsed with a non-empty buffer. Failed batches
//! land in a bounded retry queue drained with exponential backoff; five
//! consecutive write failures open a circuit breaker that routes new
//! flushes straight to the queue for thirty seconds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use timber_proto::LogEntry;
use timber_store::SharedStore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::types::LogLine;

/// Maximum number of batches held for retry; the oldest is dropped when
/// the queue is full.
const RETRY_QUEUE_CAP: usize = 100;

/// Initial and maximum delay between retry drains.
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Consecutive failures that open the circuit, and how long it stays
/// open.
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(30);

/// Bound on the final flush during shutdown.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters shared with whoever wants batcher statistics.
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    total_writes: AtomicU64,
    total_entries: AtomicU64,
    write_errors: AtomicU64,
    dropped_batches: AtomicU64,
}

/// A point-in-time snapshot of batcher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Successful batch writes.
    pub total_writes: u64,
    /// Entries committed.
    pub total_entries: u64,
    /// Failed write attempts.
    pub write_errors: u64,
    /// Batches lost to retry-queue overflow.
    pub dropped_batches: u64,
}

impl BatcherMetrics {
    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> BatcherStats {
        BatcherStats {
            total_writes: self.total_writes.load(Ordering::Relaxed),
            total_entries: self.total_entries.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
        }
    }
}

/// Tracks consecutive write failures and opens after a threshold.
///
/// Clock-explicit so tests can drive it deterministically.
#[derive(Debug)]
struct CircuitBreaker {
    threshold: u32,
    open_duration: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold,
            open_duration,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// Records a failure; returns true if this failure opened the
    /// circuit.
    fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            let was_open = self.is_open(now);
            self.open_until = Some(now + self.open_duration);
            return !was_open;
        }
        false
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    fn is_open(&self, now: Instant) -> bool {
        matches!(self.open_until, Some(until) if now < until)
    }
}

/// Bounded FIFO of failed batches. Bounded memory wins over bounded age:
/// when full, the oldest batch is dropped.
#[derive(Debug, Default)]
struct RetryQueue {
    queue: VecDeque<Vec<LogEntry>>,
    cap: usize,
}

impl RetryQueue {
    fn new(cap: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            cap,
        }
    }

    /// Enqueues a batch; returns the dropped batch if the queue was full.
    fn push(&mut self, batch: Vec<LogEntry>) -> Option<Vec<LogEntry>> {
        let dropped = if self.queue.len() >= self.cap {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(batch);
        dropped
    }

    fn push_front(&mut self, batch: Vec<LogEntry>) {
        self.queue.push_front(batch);
    }

    fn pop(&mut self) -> Option<Vec<LogEntry>> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Accumulates [`LogLine`]s from the stream pool and commits them to a
/// store in batches.
pub struct Batcher {
    store: SharedStore,
    input: mpsc::Receiver<LogLine>,
    batch_size: usize,
    batch_timeout: Duration,

    buffer: Vec<LogEntry>,
    last_flush: Instant,
    retry: RetryQueue,
    retry_backoff: Duration,
    next_retry: Instant,
    breaker: CircuitBreaker,
    metrics: Arc<BatcherMetrics>,
}

impl Batcher {
    /// Creates a batcher reading from `input` and writing to `store`.
    #[must_use]
    pub fn new(
        store: SharedStore,
        input: mpsc::Receiver<LogLine>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            input,
            batch_size,
            batch_timeout,
            buffer: Vec::with_capacity(batch_size),
            last_flush: Instant::now(),
            retry: RetryQueue::new(RETRY_QUEUE_CAP),
            retry_backoff: RETRY_BACKOFF_INITIAL,
            next_retry: Instant::now(),
            breaker: CircuitBreaker::new(CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_OPEN_DURATION),
            metrics: Arc::new(BatcherMetrics::default()),
        }
    }

    /// Returns a handle to the batcher's counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<BatcherMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Processes log lines until the input channel closes or `cancel`
    /// fires, then performs a bounded final flush.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut flush_tick = tokio::time::interval(self.batch_timeout);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                maybe = self.input.recv() => match maybe {
                    Some(line) => {
                        self.buffer.push(line.into_entry());
                        if self.buffer.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => {
                        // Input closed: no more lines will arrive.
                        debug!("batcher input closed, flushing remaining entries");
                        self.shutdown_flush().await;
                        return;
                    }
                },

                _ = flush_tick.tick() => {
                    if !self.buffer.is_empty()
                        && self.last_flush.elapsed() >= self.batch_timeout
                    {
                        self.flush().await;
                    }
                }

                _ = tokio::time::sleep_until(self.next_retry), if !self.retry.is_empty() => {
                    self.drain_one_retry().await;
                }

                () = cancel.cancelled() => {
                    debug!("batcher cancelled, flushing remaining entries");
                    while let Ok(line) = self.input.try_recv() {
                        self.buffer.push(line.into_entry());
                    }
                    self.shutdown_flush().await;
                    return;
                }
            }
        }
    }

    /// Moves the buffer into a write attempt, or straight into the retry
    /// queue while the circuit is open.
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        self.last_flush = Instant::now();

        if self.breaker.is_open(Instant::now()) {
            debug!(entries = batch.len(), "circuit open, queueing batch for retry");
            self.enqueue_retry(batch);
            return;
        }

        match self.store.write(batch.clone()).await {
            Ok(n) => {
                self.breaker.record_success();
                self.metrics.total_writes.fetch_add(1, Ordering::Relaxed);
                self.metrics.total_entries.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(entries = batch.len(), error = %e, "batch write failed");
                if self.breaker.record_failure(Instant::now()) {
                    warn!(
                        open_for = ?CIRCUIT_OPEN_DURATION,
                        "circuit breaker opened after consecutive write failures"
                    );
                }
                self.enqueue_retry(batch);
            }
        }
    }

    /// Attempts one queued batch; success resets the backoff, failure
    /// doubles it. While the circuit is open no write is attempted and
    /// the drain is rescheduled.
    async fn drain_one_retry(&mut self) {
        if self.breaker.is_open(Instant::now()) {
            self.next_retry = Instant::now() + self.retry_backoff;
            return;
        }
        let Some(batch) = self.retry.pop() else {
            return;
        };

        match self.store.write(batch.clone()).await {
            Ok(n) => {
                self.breaker.record_success();
                self.retry_backoff = RETRY_BACKOFF_INITIAL;
                self.metrics.total_writes.fetch_add(1, Ordering::Relaxed);
                self.metrics.total_entries.fetch_add(n as u64, Ordering::Relaxed);
                debug!(entries = n, "retried batch committed");
            }
            Err(e) => {
                self.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                if self.breaker.record_failure(Instant::now()) {
                    warn!(
                        open_for = ?CIRCUIT_OPEN_DURATION,
                        "circuit breaker opened after consecutive write failures"
                    );
                }
                self.retry.push_front(batch);
                self.retry_backoff = (self.retry_backoff * 2).min(RETRY_BACKOFF_MAX);
                debug!(
                    backoff = ?self.retry_backoff,
                    error = %e,
                    "retry failed, backing off"
                );
            }
        }
        self.next_retry = Instant::now() + self.retry_backoff;
    }

    fn enqueue_retry(&mut self, batch: Vec<LogEntry>) {
        if self.retry.is_empty() {
            self.next_retry = Instant::now() + self.retry_backoff;
        }
        if let Some(dropped) = self.retry.push(batch) {
            self.metrics.dropped_batches.fetch_add(1, Ordering::Relaxed);
            warn!(
                entries = dropped.len(),
                "retry queue full, dropping oldest batch"
            );
        }
    }

    /// Final flush on shutdown, bounded in time. Batches that still fail
    /// are surrendered.
    async fn shutdown_flush(&mut self) {
        let result = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, async {
            if !self.buffer.is_empty() {
                let batch = std::mem::take(&mut self.buffer);
                match self.store.write(batch).await {
                    Ok(n) => {
                        self.metrics.total_writes.fetch_add(1, Ordering::Relaxed);
                        self.metrics.total_entries.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "final flush failed, entries lost");
                    }
                }
            }
            while let Some(batch) = self.retry.pop() {
                match self.store.write(batch).await {
                    Ok(n) => {
                        self.metrics.total_writes.fetch_add(1, Ordering::Relaxed);
                        self.metrics.total_entries.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!(error = %e, "final retry drain failed, batch lost");
                    }
                }
            }
        })
        .await;

        if result.is_err() {
            warn!("final flush timed out, remaining batches surrendered");
        }
    }
}
