//! WebSocket RPC server wrapping the storage contract.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use timber_store::SharedStore;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::session::run_session;

/// Storage RPC server. One session task per connection; all sessions
/// dispatch against the same shared store.
pub struct StorageServer {
    listener: TcpListener,
    store: SharedStore,
    serving: Arc<AtomicBool>,
}

impl StorageServer {
    /// Binds the listener and prepares the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str, store: SharedStore) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        Ok(Self {
            listener,
            store,
            serving: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Returns the bound address (useful with port zero).
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `cancel` fires, then waits for open
    /// sessions to finish.
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal listener failure.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "storage server listening");

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "new connection");
                            let store = Arc::clone(&self.store);
                            let serving = Arc::clone(&self.serving);
                            let session_cancel = cancel.child_token();

                            tracker.spawn(async move {
                                let ws = match accept_async(stream).await {
                                    Ok(ws) => ws,
                                    Err(e) => {
                                        warn!(peer = %peer, error = %e, "websocket handshake failed");
                                        return;
                                    }
                                };
                                match run_session(ws, store, serving, session_cancel).await {
                                    Ok(()) => debug!(peer = %peer, "session ended"),
                                    Err(e) => {
                                        debug!(peer = %peer, error = %e, "session ended with error");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }

                () = cancel.cancelled() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.serving.store(false, Ordering::Release);
        tracker.close();
        tracker.wait().await;
        info!("storage server stopped");
        Ok(())
    }
}
