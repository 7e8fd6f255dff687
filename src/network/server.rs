//! Relay server
//!
//! Accepts connections and rebroadcasts whatever one peer sends to every
//! other connected peer.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::connection::{CloseReason, ConnectionId, RelayConnection};
use super::registry::ConnectionRegistry;
use crate::config::ServerConfig;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A peer was accepted and is being relayed
    ClientConnected { id: ConnectionId, addr: SocketAddr },
    /// A non-loopback peer was turned away
    ClientRejected { addr: SocketAddr },
    /// A peer's connection closed
    ClientDisconnected {
        id: ConnectionId,
        addr: SocketAddr,
        reason: CloseReason,
    },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Relay server
pub struct Server {
    /// Server configuration
    config: ServerConfig,
    /// Open connections
    registry: Arc<ConnectionRegistry>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Accept loop task
    accept_task: Option<JoinHandle<()>>,
    /// Whether the server is running
    running: RwLock<bool>,
}

impl Server {
    /// Create a new server
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            accept_task: None,
            running: RwLock::new(false),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the listener and start accepting; returns the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if *self.running.read().await {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        self.registry.reopen().await;
        *self.running.write().await = true;

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let config = self.config.clone();
        let registry = self.registry.clone();
        let event_tx = self.event_tx.clone();

        // Spawn the accept loop
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                handle_accept(stream, addr, &config, &registry, &event_tx);
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                emit(&event_tx, ServerEvent::Error { message: e.to_string() });
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }
        }));

        Ok(local_addr)
    }

    /// Stop accepting and drop every open connection.
    ///
    /// Returns once the listener is closed; no peer is registered afterwards.
    pub async fn stop(&mut self) -> ServerResult<()> {
        if !*self.running.read().await {
            return Err(ServerError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop failed: {}", e);
            }
        }

        // Connections accepted before the loop ended may still be registering;
        // a closed registry turns them away.
        let closed = self.registry.close_all().await;
        tracing::info!("Closed {} connection(s)", closed);

        *self.running.write().await = false;
        emit(&self.event_tx, ServerEvent::Stopped);

        Ok(())
    }

    /// Number of connected peers
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Whether a peer may connect under the loopback restriction
pub fn is_trusted_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(v6.is_loopback(), |v4| v4.is_loopback()),
        IpAddr::V4(v4) => v4.is_loopback(),
    }
}

fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    // Events are advisory; never stall the relay on a slow consumer.
    let _ = event_tx.try_send(event);
}

fn handle_accept(
    stream: TcpStream,
    addr: SocketAddr,
    config: &ServerConfig,
    registry: &Arc<ConnectionRegistry>,
    event_tx: &mpsc::Sender<ServerEvent>,
) {
    if registry.is_closed() {
        tracing::debug!("Shutting down, closing connection to {}", addr);
        return;
    }

    if config.restrict_to_loopback && !is_trusted_peer(addr.ip()) {
        tracing::info!("Closing connection to non-loopback client: {}", addr);
        emit(event_tx, ServerEvent::ClientRejected { addr });
        drop(stream);
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("{}: failed to set TCP_NODELAY: {}", addr, e);
    }

    let conn = RelayConnection::new(
        stream,
        addr,
        config.read_buffer_size,
        config.send_queue_capacity,
    );
    let id = conn.id();
    emit(event_tx, ServerEvent::ClientConnected { id, addr });

    let registry = registry.clone();
    let event_tx = event_tx.clone();
    tokio::spawn(async move {
        let reason = conn.run(registry).await;
        emit(&event_tx, ServerEvent::ClientDisconnected { id, addr, reason });
    });
}
