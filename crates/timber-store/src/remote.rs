//! Remote storage client over the WebSocket RPC transport.
//!
//! [`RemoteStore`] is a drop-in [`Store`] implementation: a background
//! connection task owns the socket, correlates responses to requests by
//! envelope id, and reconnects with exponential backoff. Requests that
//! are in flight when the connection drops fail with a transport error
//! rather than being resent, so delivery is at most once per
//! connection; the server's dedup index makes caller-level retries
//! safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use timber_proto::{
    timestamp_nanos, ErrorCode, HealthStatus, LogEntry, Query, QueryResult, RequestEnvelope,
    ResponseEnvelope, StorageRequest, StorageResponse, StoreStats, WireEntry,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::traits::Store;

/// Interval between client keepalive pings, sent even when idle.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Ceiling on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for the given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

enum Command {
    Request {
        request: StorageRequest,
        reply: oneshot::Sender<Result<StorageResponse>>,
    },
}

/// Remote implementation of the storage contract.
pub struct RemoteStore {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl RemoteStore {
    /// Creates a client for the storage service at `url`
    /// (e.g. `ws://storage:7700`).
    ///
    /// The connection is established lazily by a background task;
    /// requests issued while disconnected fail with a transport error.
    #[must_use]
    pub fn connect(url: impl Into<String>) -> Self {
        Self::connect_with(url, ReconnectConfig::default())
    }

    /// Creates a client with custom reconnection behavior.
    #[must_use]
    pub fn connect_with(url: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let task = ConnectionTask {
            url: url.into(),
            reconnect,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(cmd_rx));

        Self {
            cmd_tx,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Probes the health of the storage service.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unreachable.
    pub async fn health(&self) -> Result<HealthStatus> {
        match self.request(StorageRequest::Health).await? {
            StorageResponse::Health { status } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    async fn request(&self, request: StorageRequest) -> Result<StorageResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { request, reply })
            .await
            .map_err(|_| StoreError::Closed)?;

        let response = rx
            .await
            .map_err(|_| StoreError::Transport("connection task dropped request".into()))??;

        match response {
            StorageResponse::Error { code, message } => Err(map_remote_error(code, message)),
            other => Ok(other),
        }
    }
}

/// Translates wire error codes back to domain errors.
fn map_remote_error(code: ErrorCode, message: String) -> StoreError {
    match code {
        ErrorCode::NotFound => StoreError::NotFound,
        code => StoreError::Remote { code, message },
    }
}

fn unexpected(response: &StorageResponse) -> StoreError {
    StoreError::Transport(format!("unexpected response variant: {response:?}"))
}

#[async_trait]
impl Store for RemoteStore {
    async fn write(&self, entries: Vec<LogEntry>) -> Result<usize> {
        let entries = entries.into_iter().map(WireEntry::from).collect();
        match self.request(StorageRequest::Write { entries }).await? {
            StorageResponse::Write { count } => Ok(count as usize),
            other => Err(unexpected(&other)),
        }
    }

    async fn query(&self, query: Query) -> Result<QueryResult> {
        match self.request(StorageRequest::Query(query.into())).await? {
            StorageResponse::Query {
                entries,
                has_more,
                next_cursor,
            } => Ok(QueryResult {
                entries: entries.into_iter().map(LogEntry::from).collect(),
                has_more,
                next_cursor,
            }),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<LogEntry> {
        match self.request(StorageRequest::GetById { entry_id: id }).await? {
            StorageResponse::Entry { entry } => Ok(entry.into()),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let older_than_nanos = timestamp_nanos(cutoff);
        match self.request(StorageRequest::Delete { older_than_nanos }).await? {
            StorageResponse::Delete { deleted } => Ok(deleted),
            other => Err(unexpected(&other)),
        }
    }

    async fn stats(&self) -> Result<StoreStats> {
        let response = self.request(StorageRequest::Stats).await?;
        response
            .into_stats()
            .ok_or_else(|| StoreError::Transport("unexpected response variant".into()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        Ok(())
    }
}

struct ConnectionTask {
    url: String,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                Self::drain_remaining(&mut cmd_rx);
                return;
            }

            let connect = tokio_tungstenite::connect_async(self.url.as_str());
            let ws = tokio::select! {
                result = connect => result,
                () = self.cancel.cancelled() => {
                    Self::drain_remaining(&mut cmd_rx);
                    return;
                }
            };

            match ws {
                Ok((stream, _)) => {
                    attempt = 0;
                    debug!(url = %self.url, "connected to storage service");
                    let reason = self.run_connection(stream, &mut cmd_rx).await;
                    match reason {
                        Disconnect::Shutdown => return,
                        Disconnect::Lost(reason) => {
                            warn!(url = %self.url, reason = %reason, "storage connection lost");
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.reconnect.delay_for_attempt(attempt);
                    debug!(
                        url = %self.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "storage connection failed, backing off"
                    );
                    if self.wait_disconnected(delay, &mut cmd_rx).await {
                        Self::drain_remaining(&mut cmd_rx);
                        return;
                    }
                }
            }
        }
    }

    /// Runs one established connection until it drops or the client
    /// shuts down.
    async fn run_connection(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        cmd_rx: &mut mpsc::Receiver<Command>,
    ) -> Disconnect {
        let (mut write, mut read) = stream.split();
        let mut pending: HashMap<u64, oneshot::Sender<Result<StorageResponse>>> = HashMap::new();
        let mut next_id: u64 = 1;
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    fail_pending(&mut pending, || StoreError::Cancelled);
                    let _ = write.send(Message::Close(None)).await;
                    return Disconnect::Shutdown;
                }

                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        fail_pending(&mut pending, transport_lost);
                        return Disconnect::Lost("ping failed".into());
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match ResponseEnvelope::from_json(&text) {
                                Ok(envelope) => {
                                    if let Some(reply) = pending.remove(&envelope.id) {
                                        let _ = reply.send(Ok(envelope.response));
                                    } else {
                                        warn!(id = envelope.id, "response for unknown request id");
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "failed to parse storage response");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            fail_pending(&mut pending, transport_lost);
                            return Disconnect::Lost("server closed connection".into());
                        }
                        Some(Err(e)) => {
                            fail_pending(&mut pending, transport_lost);
                            return Disconnect::Lost(format!("websocket error: {e}"));
                        }
                        None => {
                            fail_pending(&mut pending, transport_lost);
                            return Disconnect::Lost("connection closed".into());
                        }
                        _ => {
                            // Ping/Pong/Binary are handled by the transport
                            // or carry nothing for us.
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Request { request, reply }) => {
                            let id = next_id;
                            next_id += 1;
                            let envelope = RequestEnvelope { id, request };
                            match envelope.to_json() {
                                Ok(json) => {
                                    if write.send(Message::Text(json)).await.is_err() {
                                        let _ = reply.send(Err(transport_lost()));
                                        fail_pending(&mut pending, transport_lost);
                                        return Disconnect::Lost("write failed".into());
                                    }
                                    pending.insert(id, reply);
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e.into()));
                                }
                            }
                        }
                        None => {
                            fail_pending(&mut pending, || StoreError::Closed);
                            return Disconnect::Shutdown;
                        }
                    }
                }
            }
        }
    }

    /// Sleeps out the backoff window while failing incoming requests
    /// fast. Returns true if the client shut down.
    async fn wait_disconnected(
        &self,
        delay: Duration,
        cmd_rx: &mut mpsc::Receiver<Command>,
    ) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => return false,
                () = self.cancel.cancelled() => return true,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Request { reply, .. }) => {
                        let _ = reply.send(Err(StoreError::Transport(
                            "storage service unavailable".into(),
                        )));
                    }
                    None => return true,
                },
            }
        }
    }

    fn drain_remaining(cmd_rx: &mut mpsc::Receiver<Command>) {
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            let Command::Request { reply, .. } = cmd;
            let _ = reply.send(Err(StoreError::Closed));
        }
    }
}

enum Disconnect {
    /// The client was closed; do not reconnect.
    Shutdown,
    /// The connection dropped; reconnect after backoff.
    Lost(String),
}

fn transport_lost() -> StoreError {
    StoreError::Transport("connection lost".into())
}

fn fail_pending(
    pending: &mut HashMap<u64, oneshot::Sender<Result<StorageResponse>>>,
    err: impl Fn() -> StoreError,
) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(err()));
    }
}
