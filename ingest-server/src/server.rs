//! TCP listener: one task per accepted connection, all sharing one coordinator.
//!
//! Live connections are tracked by abort handle so shutdown can close every one of them
//! before the coordinator finalizes whatever sessions are still open.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::connection::handle_connection;
use crate::coordinator::Coordinator;

struct Shared {
    connections: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn lock_connections(&self) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

pub struct IngestServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shared: Arc<Shared>,
}

/// Cloneable handle used to stop a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    coordinator: Arc<Coordinator>,
}

impl IngestServer {
    pub async fn bind(addr: impl ToSocketAddrs, coordinator: Arc<Coordinator>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening for ingest connections");
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            coordinator,
            shared: Arc::new(Shared {
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                shutdown_tx,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
            coordinator: self.coordinator.clone(),
        }
    }

    /// Accept connections until [`ServerHandle::shutdown`] is called. Returns an error only if
    /// the listening socket itself fails.
    pub async fn run(self) -> io::Result<()> {
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        while !self.shared.is_shutdown() {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "accept failed");
                    }
                    Err(e) => {
                        error!(error = %e, "listener failed");
                        return Err(e);
                    }
                },
                _ = shutdown_rx.changed() => {}
            }
        }
        info!("listener stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        // Held across spawn + insert so a shutdown in between cannot miss this connection
        // and the task cannot deregister before it is registered.
        let mut connections = self.shared.lock_connections();
        if self.shared.is_shutdown() {
            return;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        info!(%peer, id, "accepted connection");
        let coordinator = self.coordinator.clone();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            match handle_connection(stream, peer, coordinator).await {
                Ok(()) => info!(%peer, id, "connection closed"),
                Err(e) => error!(%peer, id, error = %e, "connection terminated"),
            }
            shared.lock_connections().remove(&id);
        });
        connections.insert(id, task.abort_handle());
    }
}

impl ServerHandle {
    /// Stop accepting, close every live connection, then close every open session.
    pub async fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);
        let live: Vec<AbortHandle> = self
            .shared
            .lock_connections()
            .drain()
            .map(|(_, h)| h)
            .collect();
        if !live.is_empty() {
            info!(count = live.len(), "closing live connections");
        }
        for handle in live {
            handle.abort();
        }
        self.coordinator.shutdown().await;
    }

    pub fn live_connections(&self) -> usize {
        self.shared.lock_connections().len()
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
