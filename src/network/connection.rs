//! Relay connection handling
//!
//! Drives one accepted peer through `Connecting -> Open -> Closed`:
//! - Registers the peer with the [`ConnectionRegistry`]
//! - Broadcasts every chunk it reads to all other peers
//! - Drains its outbound queue to the socket from a writer task
//! - Removes itself from the registry exactly once on close

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::registry::ConnectionRegistry;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not yet registered
    Connecting,
    /// Registered and relaying
    Open,
    /// Removed from the registry; terminal
    Closed,
}

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side (read returned zero bytes)
    PeerClosed,
    /// Read from the socket failed
    ReadError(String),
    /// Writing to the socket failed
    WriteError(String),
    /// The relay dropped this connection (shutdown or removal)
    Dropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed connection"),
            Self::ReadError(e) => write!(f, "read error: {}", e),
            Self::WriteError(e) => write!(f, "write error: {}", e),
            Self::Dropped => write!(f, "dropped by relay"),
        }
    }
}

/// A handle for queueing bytes to a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    addr: SocketAddr,
    sender: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(addr: SocketAddr, sender: mpsc::Sender<Bytes>) -> Self {
        Self::with_id(ConnectionId::next(), addr, sender)
    }

    pub(crate) fn with_id(id: ConnectionId, addr: SocketAddr, sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            addr,
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue bytes without waiting
    pub fn try_send(&self, data: Bytes) -> Result<(), mpsc::error::TrySendError<Bytes>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(mpsc::error::TrySendError::Closed(data));
        }
        self.sender.try_send(data)
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// One accepted peer of the relay
pub struct RelayConnection<S> {
    id: ConnectionId,
    remote_addr: SocketAddr,
    stream: S,
    state: ConnectionState,
    read_buffer_size: usize,
    queue_capacity: usize,
}

impl<S> RelayConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        remote_addr: SocketAddr,
        read_buffer_size: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            remote_addr,
            stream,
            state: ConnectionState::Connecting,
            read_buffer_size: read_buffer_size.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Relay until the connection closes, returning why it closed
    pub async fn run(mut self, registry: Arc<ConnectionRegistry>) -> CloseReason {
        let (mut reader, writer) = tokio::io::split(self.stream);
        let id = self.id;
        let addr = self.remote_addr;

        let (tx, rx) = mpsc::channel::<Bytes>(self.queue_capacity);
        let handle = ConnectionHandle::with_id(id, addr, tx);

        let mut writer_task = spawn_writer(writer, rx, addr);

        // The registry holds the only sender; removing the handle ends the writer.
        if !registry.add(handle).await {
            tracing::debug!("{}: relay is shutting down, not registering ({})", addr, id);
            self.state = ConnectionState::Closed;
            let _ = writer_task.await;
            return CloseReason::Dropped;
        }
        self.state = ConnectionState::Open;
        tracing::info!("{} connected ({})", addr, id);

        let mut buf = vec![0u8; self.read_buffer_size];
        let reason = loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => break CloseReason::PeerClosed,
                        Ok(n) => {
                            tracing::debug!("{}: received {} bytes", addr, n);
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            let report = registry.broadcast(data, Some(id)).await;
                            tracing::trace!(
                                "{}: relayed to {} peer(s), {} slow peer(s) dropped",
                                addr,
                                report.delivered,
                                report.dropped
                            );
                        }
                        Err(e) => break CloseReason::ReadError(e.to_string()),
                    }
                }
                result = &mut writer_task => {
                    break match result {
                        Ok(Ok(())) => CloseReason::Dropped,
                        Ok(Err(e)) => CloseReason::WriteError(e.to_string()),
                        Err(e) => CloseReason::WriteError(format!("writer task failed: {}", e)),
                    };
                }
            }
        };

        registry.remove(id).await;
        self.state = ConnectionState::Closed;

        // Peer is gone or dropped; anything still queued is discarded.
        if !writer_task.is_finished() {
            writer_task.abort();
        }

        match &reason {
            CloseReason::PeerClosed | CloseReason::Dropped => {
                tracing::info!("{}: connection closed ({})", addr, reason);
            }
            _ => tracing::warn!("{}: connection closed ({})", addr, reason),
        }

        reason
    }
}

fn spawn_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    addr: SocketAddr,
) -> JoinHandle<std::io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            writer.write_all(&data).await?;
            writer.flush().await?;
            tracing::trace!("{}: wrote {} bytes", addr, data.len());
        }
        let _ = writer.shutdown().await;
        Ok(())
    })
}
