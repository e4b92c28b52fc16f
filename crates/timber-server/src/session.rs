//! Per-connection RPC session.
//!
//! Each session reads request envelopes off one WebSocket connection,
//! dispatches them against the shared store, and writes the matching
//! response envelopes back. The session also owns the keepalive policy:
//! the server pings every fifteen seconds with a five-second ack
//! deadline, and disconnects clients that ping more often than every
//! ten seconds. Connections carrying no RPC traffic are permitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use timber_proto::{
    timestamp_from_nanos, ErrorCode, HealthStatus, LogEntry, RequestEnvelope, ResponseEnvelope,
    StorageRequest, StorageResponse, WireEntry,
};
use timber_store::{SharedStore, StoreError};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};

/// Interval between server keepalive pings.
const SERVER_PING_INTERVAL: Duration = Duration::from_secs(15);

/// How long the server waits for a ping ack.
const PING_ACK_DEADLINE: Duration = Duration::from_secs(5);

/// Minimum allowed interval between client pings.
const MIN_CLIENT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Early pings tolerated before the client is disconnected. Absorbs
/// network jitter around the minimum interval.
const MAX_PING_STRIKES: u32 = 2;

/// Runs one connection until the peer disconnects, the keepalive policy
/// trips, or the server shuts down.
///
/// # Errors
///
/// Returns an error describing why the session ended abnormally.
pub async fn run_session(
    ws: WebSocketStream<TcpStream>,
    store: SharedStore,
    serving: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut write, mut read) = ws.split();

    let mut ping = tokio::time::interval(SERVER_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so the first ping goes out
    // one interval after the handshake.
    ping.tick().await;

    let mut awaiting_ack: Option<Instant> = None;
    let mut last_client_ping: Option<Instant> = None;
    let mut ping_strikes: u32 = 0;
    // A deadline parked far in the future keeps the select arm inert
    // while no ack is outstanding.
    let far_future = || Instant::now() + Duration::from_secs(86_400);

    loop {
        let ack_deadline = awaiting_ack.unwrap_or_else(far_future);

        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            _ = ping.tick() => {
                if awaiting_ack.is_none() {
                    write.send(Message::Ping(Vec::new())).await?;
                    awaiting_ack = Some(Instant::now() + PING_ACK_DEADLINE);
                }
            }

            () = tokio::time::sleep_until(ack_deadline), if awaiting_ack.is_some() => {
                warn!("client failed to ack keepalive ping");
                return Err(ServerError::KeepaliveTimeout);
            }

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match RequestEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            let response = dispatch(&store, &serving, envelope.request).await;
                            let reply = ResponseEnvelope {
                                id: envelope.id,
                                response,
                            };
                            write.send(Message::Text(reply.to_json()?)).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse request");
                        }
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // The transport answers the ping; the session only
                    // enforces the minimum interval.
                    let now = Instant::now();
                    if let Some(prev) = last_client_ping {
                        if now.duration_since(prev) < MIN_CLIENT_PING_INTERVAL {
                            ping_strikes += 1;
                            warn!(ping_strikes, "client pinged below the minimum interval");
                            if ping_strikes > MAX_PING_STRIKES {
                                return Err(ServerError::PingPolicyViolation);
                            }
                        }
                    }
                    last_client_ping = Some(now);
                }
                Some(Ok(Message::Pong(_))) => {
                    awaiting_ack = None;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Dispatches one request against the store, translating errors to wire
/// codes: absent rows become `NOT_FOUND`, storage failures `INTERNAL`.
async fn dispatch(
    store: &SharedStore,
    serving: &AtomicBool,
    request: StorageRequest,
) -> StorageResponse {
    match request {
        StorageRequest::Write { entries } => {
            let entries: Vec<LogEntry> = entries.into_iter().map(LogEntry::from).collect();
            match store.write(entries).await {
                Ok(count) => StorageResponse::Write {
                    count: count as u32,
                },
                Err(e) => error_response(&e),
            }
        }
        StorageRequest::Query(query) => match store.query(query.into()).await {
            Ok(result) => StorageResponse::Query {
                entries: result.entries.into_iter().map(WireEntry::from).collect(),
                has_more: result.has_more,
                next_cursor: result.next_cursor,
            },
            Err(e) => error_response(&e),
        },
        StorageRequest::GetById { entry_id } => match store.get_by_id(entry_id).await {
            Ok(entry) => StorageResponse::Entry {
                entry: entry.into(),
            },
            Err(e) => error_response(&e),
        },
        StorageRequest::Delete { older_than_nanos } => {
            match store.delete_older_than(timestamp_from_nanos(older_than_nanos)).await {
                Ok(deleted) => StorageResponse::Delete { deleted },
                Err(e) => error_response(&e),
            }
        }
        StorageRequest::Stats => match store.stats().await {
            Ok(stats) => StorageResponse::from_stats(&stats),
            Err(e) => error_response(&e),
        },
        StorageRequest::Health => StorageResponse::Health {
            status: if serving.load(Ordering::Acquire) {
                HealthStatus::Serving
            } else {
                HealthStatus::NotServing
            },
        },
    }
}

fn error_response(error: &StoreError) -> StorageResponse {
    let code = if error.is_not_found() {
        ErrorCode::NotFound
    } else {
        ErrorCode::Internal
    };
    StorageResponse::Error {
        code,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use timber_proto::{Query, QueryResult, Severity, StoreStats, WireQuery};
    use timber_store::Result as StoreResult;
    use timber_store::Store;

    struct StubStore {
        entries: Mutex<Vec<LogEntry>>,
        fail_writes: bool,
    }

    impl StubStore {
        fn shared(fail_writes: bool) -> SharedStore {
            Arc::new(Self {
                entries: Mutex::new(Vec::new()),
                fail_writes,
            })
        }
    }

    #[async_trait]
    impl Store for StubStore {
        async fn write(&self, entries: Vec<LogEntry>) -> StoreResult<usize> {
            if self.fail_writes {
                return Err(StoreError::Internal("disk full".into()));
            }
            let n = entries.len();
            self.entries.lock().extend(entries);
            Ok(n)
        }

        async fn query(&self, _query: Query) -> StoreResult<QueryResult> {
            Ok(QueryResult {
                entries: self.entries.lock().clone(),
                has_more: false,
                next_cursor: 0,
            })
        }

        async fn get_by_id(&self, id: i64) -> StoreResult<LogEntry> {
            self.entries
                .lock()
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> StoreResult<u64> {
            Ok(2)
        }

        async fn stats(&self) -> StoreResult<StoreStats> {
            Ok(StoreStats {
                total_entries: self.entries.lock().len() as i64,
                ..Default::default()
            })
        }

        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    fn wire_entry(message: &str) -> WireEntry {
        WireEntry {
            id: 0,
            timestamp_nanos: 1_000,
            namespace: "default".into(),
            pod: "p".into(),
            container: "c".into(),
            severity: Severity::Info as u32,
            message: message.into(),
            attributes: None,
        }
    }

    fn serving_flag(serving: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(serving))
    }

    #[tokio::test]
    async fn write_dispatch_returns_count() {
        let store = StubStore::shared(false);
        let response = dispatch(
            &store,
            &serving_flag(true),
            StorageRequest::Write {
                entries: vec![wire_entry("a"), wire_entry("b")],
            },
        )
        .await;
        assert_eq!(response, StorageResponse::Write { count: 2 });
    }

    #[tokio::test]
    async fn write_failure_maps_to_internal() {
        let store = StubStore::shared(true);
        let response = dispatch(
            &store,
            &serving_flag(true),
            StorageRequest::Write {
                entries: vec![wire_entry("a")],
            },
        )
        .await;
        match response {
            StorageResponse::Error { code, message } => {
                assert_eq!(code, ErrorCode::Internal);
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_entry_maps_to_not_found() {
        let store = StubStore::shared(false);
        let response =
            dispatch(&store, &serving_flag(true), StorageRequest::GetById { entry_id: 42 }).await;
        match response {
            StorageResponse::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_dispatch_round_trips() {
        let store = StubStore::shared(false);
        dispatch(
            &store,
            &serving_flag(true),
            StorageRequest::Write {
                entries: vec![wire_entry("hello")],
            },
        )
        .await;

        let response = dispatch(
            &store,
            &serving_flag(true),
            StorageRequest::Query(WireQuery::default()),
        )
        .await;
        match response {
            StorageResponse::Query { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].message, "hello");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_dispatch_reports_count() {
        let store = StubStore::shared(false);
        let response = dispatch(
            &store,
            &serving_flag(true),
            StorageRequest::Delete {
                older_than_nanos: 5_000,
            },
        )
        .await;
        assert_eq!(response, StorageResponse::Delete { deleted: 2 });
    }

    #[tokio::test]
    async fn health_reflects_serving_flag() {
        let store = StubStore::shared(false);

        let response = dispatch(&store, &serving_flag(true), StorageRequest::Health).await;
        assert_eq!(
            response,
            StorageResponse::Health {
                status: HealthStatus::Serving
            }
        );

        let response = dispatch(&store, &serving_flag(false), StorageRequest::Health).await;
        assert_eq!(
            response,
            StorageResponse::Health {
                status: HealthStatus::NotServing
            }
        );
    }
}
