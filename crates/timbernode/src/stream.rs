//! Per-container log tail with resume, idle detection, and retries.
//!
//! A [`ContainerStream`] drives one container's log stream: open, tail,
//! detect idle or terminated, reconnect with bounded backoff, and
//! resume from a cursor so reconnects neither duplicate nor drop lines
//! (except lines surrendered to the backpressure rule).
//!
//! The Kubernetes calls sit behind [`LogSource`] so tests can drive the
//! state machine with a fake source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CollectorError, Result};
use crate::parser::Parser;
use crate::types::{ContainerRef, LogLine};

/// Backoff bounds for stream reconnection.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How long a blocked downstream send may wait before the line is
/// dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream of raw log lines from one container.
pub type LineStream = BoxStream<'static, std::io::Result<String>>;

/// Source of container log lines. The production implementation talks
/// to the Kubernetes API; tests substitute a fake.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Opens a follow-mode log stream with server-side timestamps,
    /// starting at `since` when set (the bound is inclusive).
    ///
    /// # Errors
    ///
    /// Returns an error if the stream could not be opened.
    async fn open(
        &self,
        container: &ContainerRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<LineStream>;

    /// Reports whether the container is still running, matching the pod
    /// UID first so a reused pod name is not mistaken for the old pod.
    async fn is_container_running(&self, container: &ContainerRef) -> bool;
}

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, not yet started.
    Idle,
    /// Opening the log stream.
    Opening,
    /// Reading lines.
    Tailing,
    /// Backing off before another open.
    Reconnecting,
    /// Finished, successfully or not.
    Terminated,
}

/// A point-in-time snapshot of stream statistics.
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// The container this stream reads.
    pub container: ContainerRef,
    /// Current lifecycle state.
    pub state: StreamState,
    /// Lines delivered downstream (or dropped past the send timeout).
    pub lines_read: u64,
    /// Retryable errors encountered.
    pub errors: u64,
    /// Description of the most recent error.
    pub last_error: Option<String>,
    /// Cursor: timestamp of the newest line accounted for.
    pub last_sent: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    lines_read: u64,
    errors: u64,
    last_error: Option<String>,
    /// Highest timestamp delivered (or deliberately dropped); the next
    /// open resumes at this plus one nanosecond.
    last_sent: Option<DateTime<Utc>>,
}

/// Reads logs from a single container until it terminates, the scope is
/// cancelled, or a non-retryable error occurs.
pub struct ContainerStream {
    container: ContainerRef,
    source: Arc<dyn LogSource>,
    output: mpsc::Sender<LogLine>,
    parser: Arc<Parser>,
    since_time: Option<DateTime<Utc>>,
    idle_timeout: Duration,
    inner: Mutex<StreamInner>,
}

impl ContainerStream {
    /// Creates a stream for the given container.
    #[must_use]
    pub fn new(
        source: Arc<dyn LogSource>,
        container: ContainerRef,
        output: mpsc::Sender<LogLine>,
        parser: Arc<Parser>,
        since_time: Option<DateTime<Utc>>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            container,
            source,
            output,
            parser,
            since_time,
            idle_timeout,
            inner: Mutex::new(StreamInner {
                state: StreamState::Idle,
                lines_read: 0,
                errors: 0,
                last_error: None,
                last_sent: None,
            }),
        }
    }

    /// Returns a snapshot of stream statistics.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let inner = self.inner.lock();
        StreamStats {
            container: self.container.clone(),
            state: inner.state,
            lines_read: inner.lines_read,
            errors: inner.errors,
            last_error: inner.last_error.clone(),
            last_sent: inner.last_sent,
        }
    }

    /// Tails the container until it terminates or `cancel` fires.
    /// Retryable errors reconnect with exponential backoff; the cursor
    /// guarantees reconnects do not redeliver lines.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Cancelled`] on cancellation, or the
    /// final non-retryable error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = BACKOFF_INITIAL;

        loop {
            let since = {
                let inner = self.inner.lock();
                // One nanosecond past the cursor: sinceTime is inclusive
                // and the cursor line was already delivered.
                inner
                    .last_sent
                    .map(|t| t + chrono::Duration::nanoseconds(1))
                    .or(self.since_time)
            };

            let result = self.run_once(since, &cancel, &mut backoff).await;

            match result {
                Ok(()) => {
                    self.set_state(StreamState::Terminated);
                    return Ok(());
                }
                Err(e) if cancel.is_cancelled() => {
                    self.set_state(StreamState::Terminated);
                    debug!(container = %self.container, "stream cancelled");
                    return Err(e);
                }
                Err(e) if !e.is_retryable() => {
                    self.record_error(&e);
                    self.set_state(StreamState::Terminated);
                    return Err(e);
                }
                Err(e) => {
                    self.record_error(&e);
                    self.set_state(StreamState::Reconnecting);
                    debug!(
                        container = %self.container,
                        error = %e,
                        backoff = ?backoff,
                        "stream error, reconnecting"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = cancel.cancelled() => {
                            self.set_state(StreamState::Terminated);
                            return Err(CollectorError::Cancelled);
                        }
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// One open-and-tail attempt. Resets `backoff` once the stream is
    /// open.
    async fn run_once(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<()> {
        self.set_state(StreamState::Opening);

        let mut lines = tokio::select! {
            result = self.source.open(&self.container, since) => result?,
            () = cancel.cancelled() => return Err(CollectorError::Cancelled),
        };

        *backoff = BACKOFF_INITIAL;
        self.set_state(StreamState::Tailing);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(CollectorError::Cancelled),

                next = tokio::time::timeout(self.idle_timeout, lines.next()) => {
                    match next {
                        Err(_) => {
                            // No line within the idle window; the
                            // connection may be stale.
                            warn!(
                                container = %self.container,
                                idle_timeout = ?self.idle_timeout,
                                "stream idle timeout, reconnecting"
                            );
                            return Err(CollectorError::IdleTimeout(self.idle_timeout));
                        }
                        Ok(Some(Ok(line))) => self.deliver(&line, cancel).await?,
                        Ok(Some(Err(e))) => {
                            return Err(CollectorError::Read(e.to_string()));
                        }
                        Ok(None) => {
                            // Clean EOF. Distinguish "pod terminated"
                            // from "connection dropped".
                            if self.source.is_container_running(&self.container).await {
                                debug!(
                                    container = %self.container,
                                    "stream closed but container still running, will reconnect"
                                );
                                return Err(CollectorError::StreamClosedUnexpectedly);
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Parses a line and sends it downstream. A send blocked past
    /// [`SEND_TIMEOUT`] drops the line but still advances the cursor so
    /// a reconnect does not re-send it.
    async fn deliver(&self, line: &str, cancel: &CancellationToken) -> Result<()> {
        let parsed = self.parser.parse(line);
        let timestamp = parsed.timestamp;
        let log_line = LogLine {
            container: self.container.clone(),
            timestamp,
            severity: parsed.severity,
            message: parsed.message,
            attributes: parsed.attributes,
        };

        match self.output.try_send(log_line) {
            Ok(()) => self.advance_cursor(timestamp, true),
            Err(TrySendError::Closed(_)) => return Err(CollectorError::OutputClosed),
            Err(TrySendError::Full(log_line)) => {
                tokio::select! {
                    () = cancel.cancelled() => return Err(CollectorError::Cancelled),
                    sent = tokio::time::timeout(SEND_TIMEOUT, self.output.send(log_line)) => {
                        match sent {
                            Ok(Ok(())) => self.advance_cursor(timestamp, true),
                            Ok(Err(_)) => return Err(CollectorError::OutputClosed),
                            Err(_) => {
                                warn!(
                                    container = %self.container,
                                    "output channel full, dropping log line"
                                );
                                // The cursor still advances past the
                                // dropped line.
                                self.advance_cursor(timestamp, false);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn advance_cursor(&self, timestamp: DateTime<Utc>, delivered: bool) {
        let mut inner = self.inner.lock();
        if delivered {
            inner.lines_read += 1;
        }
        if inner.last_sent.is_none_or(|t| timestamp > t) {
            inner.last_sent = Some(timestamp);
        }
    }

    fn set_state(&self, state: StreamState) {
        self.inner.lock().state = state;
    }

    fn record_error(&self, error: &CollectorError) {
        let mut inner = self.inner.lock();
        inner.errors += 1;
        inner.last_error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use timber_proto::Severity;

    fn sample_ref() -> ContainerRef {
        ContainerRef {
            namespace: "default".into(),
            pod_name: "api-0".into(),
            pod_uid: "uid-1".into(),
            container_name: "app".into(),
        }
    }

    /// One scripted connection: lines to emit, then an optional hang
    /// before EOF.
    struct FakeConnection {
        lines: Vec<String>,
        hang_after: bool,
    }

    /// Scripted log source. Each `open` consumes the next connection and
    /// records the `since` bound it was asked for.
    struct FakeSource {
        connections: Mutex<VecDeque<FakeConnection>>,
        opens: Mutex<Vec<Option<DateTime<Utc>>>>,
        running: AtomicBool,
    }

    impl FakeSource {
        fn new(connections: Vec<FakeConnection>, running: bool) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(connections.into()),
                opens: Mutex::new(Vec::new()),
                running: AtomicBool::new(running),
            })
        }
    }

    #[async_trait]
    impl LogSource for FakeSource {
        async fn open(
            &self,
            _container: &ContainerRef,
            since: Option<DateTime<Utc>>,
        ) -> Result<LineStream> {
            self.opens.lock().push(since);
            let Some(conn) = self.connections.lock().pop_front() else {
                return Err(CollectorError::Read("no more connections".into()));
            };

            let lines = conn.lines.clone();
            let hang_after = conn.hang_after;
            let stream = async_stream_lines(lines, hang_after);
            Ok(stream)
        }

        async fn is_container_running(&self, _container: &ContainerRef) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    /// Builds a line stream that yields the given lines then either
    /// hangs forever or ends.
    fn async_stream_lines(lines: Vec<String>, hang_after: bool) -> LineStream {
        let iter = futures::stream::iter(lines.into_iter().map(Ok));
        if hang_after {
            iter.chain(futures::stream::pending()).boxed()
        } else {
            iter.boxed()
        }
    }

    fn make_stream(
        source: Arc<FakeSource>,
        idle_timeout: Duration,
    ) -> (Arc<ContainerStream>, mpsc::Receiver<LogLine>) {
        let (tx, rx) = mpsc::channel(64);
        let stream = Arc::new(ContainerStream::new(
            source,
            sample_ref(),
            tx,
            Arc::new(Parser::new()),
            None,
            idle_timeout,
        ));
        (stream, rx)
    }

    const LINE_1: &str = "2024-01-15T10:30:00.000000001Z first line";
    const LINE_2: &str = "2024-01-15T10:30:00.000000002Z second line";

    #[tokio::test(start_paused = true)]
    async fn clean_eof_with_terminated_container_ends_stream() {
        let source = FakeSource::new(
            vec![FakeConnection {
                lines: vec![LINE_1.to_string(), LINE_2.to_string()],
                hang_after: false,
            }],
            false, // container not running: EOF is a normal termination
        );
        let (stream, mut rx) = make_stream(Arc::clone(&source), Duration::from_secs(300));

        stream.run(CancellationToken::new()).await.expect("clean exit");

        assert_eq!(rx.recv().await.expect("line 1").message, "first line");
        assert_eq!(rx.recv().await.expect("line 2").message, "second line");
        assert_eq!(stream.stats().state, StreamState::Terminated);
        assert_eq!(stream.stats().lines_read, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn eof_with_running_container_reconnects() {
        // First connection drops after one line; the container is still
        // running, so the stream must reconnect and resume past it.
        let source = FakeSource::new(
            vec![
                FakeConnection {
                    lines: vec![LINE_1.to_string()],
                    hang_after: false,
                },
                FakeConnection {
                    lines: vec![LINE_2.to_string()],
                    hang_after: false,
                },
            ],
            true,
        );
        let (stream, mut rx) = make_stream(Arc::clone(&source), Duration::from_secs(300));

        let cancel = CancellationToken::new();
        let handle = {
            let stream = Arc::clone(&stream);
            let cancel = cancel.clone();
            tokio::spawn(async move { stream.run(cancel).await })
        };

        assert_eq!(rx.recv().await.expect("line 1").message, "first line");
        assert_eq!(rx.recv().await.expect("line 2").message, "second line");

        // Second connection also hit EOF; mark the container stopped so
        // the third attempt is never needed.
        source.running.store(false, Ordering::SeqCst);
        // Exhausted connections produce a retryable error, then the next
        // cycle... stop it via cancel once both lines arrived.
        cancel.cancel();
        let _ = handle.await.expect("join");

        let opens = source.opens.lock();
        assert!(opens.len() >= 2, "stream reconnected");
        assert_eq!(opens[0], None, "first open has no cursor");
        let resume = opens[1].expect("resume cursor");
        assert_eq!(
            timber_proto::timestamp_nanos(resume),
            1_705_314_600_000_000_002,
            "resume is one nanosecond past the delivered line"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_reconnects_without_redelivery() {
        // One line, then the connection hangs. With a 200ms idle timeout
        // the stream closes itself and reopens past the first line.
        let source = FakeSource::new(
            vec![
                FakeConnection {
                    lines: vec![LINE_1.to_string()],
                    hang_after: true,
                },
                FakeConnection {
                    lines: vec![LINE_2.to_string()],
                    hang_after: false,
                },
            ],
            false,
        );
        let (stream, mut rx) = make_stream(Arc::clone(&source), Duration::from_millis(200));

        stream.run(CancellationToken::new()).await.expect("ends after second eof");

        let first = rx.recv().await.expect("line 1");
        assert_eq!(first.message, "first line");
        let second = rx.recv().await.expect("line 2");
        assert_eq!(second.message, "second line");
        assert!(rx.try_recv().is_err(), "no duplicate deliveries");

        let opens = source.opens.lock();
        assert_eq!(opens.len(), 2);
        let resume = opens[1].expect("resume cursor");
        assert!(
            resume > first.timestamp,
            "sinceTime advances past the first line"
        );
        assert_eq!(stream.stats().errors, 1, "idle timeout counted once");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_retried() {
        let source = FakeSource::new(
            vec![FakeConnection {
                lines: vec![],
                hang_after: true,
            }],
            true,
        );
        let (stream, _rx) = make_stream(source, Duration::from_secs(300));

        let cancel = CancellationToken::new();
        let handle = {
            let stream = Arc::clone(&stream);
            let cancel = cancel.clone();
            tokio::spawn(async move { stream.run(cancel).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        let result = handle.await.expect("join");
        assert!(matches!(result, Err(CollectorError::Cancelled)));
        assert_eq!(stream.stats().state, StreamState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_drop_advances_cursor() {
        // Output channel of one slot and no consumer: the second line
        // blocks, times out after 10s, and is dropped, but the cursor
        // still advances past it.
        let source = FakeSource::new(
            vec![FakeConnection {
                lines: vec![LINE_1.to_string(), LINE_2.to_string()],
                hang_after: false,
            }],
            false,
        );
        let (tx, mut rx) = mpsc::channel(1);
        let stream = Arc::new(ContainerStream::new(
            source,
            sample_ref(),
            tx,
            Arc::new(Parser::new()),
            None,
            Duration::from_secs(300),
        ));

        stream.run(CancellationToken::new()).await.expect("run");

        let stats = stream.stats();
        assert_eq!(stats.lines_read, 1, "second line was dropped");
        assert_eq!(
            stats.last_sent.map(timber_proto::timestamp_nanos),
            Some(1_705_314_600_000_000_002),
            "cursor covers the dropped line"
        );

        assert_eq!(rx.recv().await.expect("line 1").message, "first line");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_retries_with_backoff() {
        // No connections at all: every open fails, the stream keeps
        // retrying until cancelled.
        let source = FakeSource::new(vec![], true);
        let (stream, _rx) = make_stream(Arc::clone(&source), Duration::from_secs(300));

        let cancel = CancellationToken::new();
        let handle = {
            let stream = Arc::clone(&stream);
            let cancel = cancel.clone();
            tokio::spawn(async move { stream.run(cancel).await })
        };

        // Paused time fast-forwards the 1s, 2s, 4s backoffs.
        tokio::time::sleep(Duration::from_secs(8)).await;
        cancel.cancel();
        let result = handle.await.expect("join");
        assert!(matches!(result, Err(CollectorError::Cancelled)));

        let opens = source.opens.lock().len();
        assert!(opens >= 3, "open retried with backoff, got {opens}");
        assert!(stream.stats().errors >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lines_carry_parsed_fields() {
        let source = FakeSource::new(
            vec![FakeConnection {
                lines: vec![
                    r#"2024-01-15T10:30:00Z {"level":"error","msg":"boom","traceId":"t1"}"#
                        .to_string(),
                ],
                hang_after: false,
            }],
            false,
        );
        let (stream, mut rx) = make_stream(source, Duration::from_secs(300));
        stream.run(CancellationToken::new()).await.expect("run");

        let line = rx.recv().await.expect("line");
        assert_eq!(line.severity, Severity::Error);
        assert_eq!(line.message, "boom");
        assert_eq!(
            line.attributes.as_ref().and_then(|a| a.get("trace_id")).map(String::as_str),
            Some("t1")
        );
        assert_eq!(line.container, sample_ref());
    }
}
