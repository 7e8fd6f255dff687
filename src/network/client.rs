//! Relay client
//!
//! Connects to a relay, sends events as frames and dispatches every
//! received frame to the handlers registered on its [`Dispatcher`].

use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::dispatch::{Dispatcher, EventData, HandlerRef};
use crate::protocol::{CodecError, CodecResult, Frame, FrameReader};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Successfully connected to the relay
    Connected { server_addr: SocketAddr },
    /// Connection ended
    Disconnected { reason: String },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Relay client
pub struct RelayClient {
    /// Client configuration
    config: ClientConfig,
    /// Handlers for received events
    dispatcher: Arc<Dispatcher>,
    /// Current state
    state: Arc<RwLock<ClientState>>,
    /// Write half of the connection
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    /// Receive loop task
    receive_task: StdMutex<Option<JoinHandle<()>>>,
    /// Event sender
    event_tx: mpsc::Sender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl RelayClient {
    /// Create a new client with an empty dispatcher
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);

        Self {
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            receive_task: StdMutex::new(None),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Handlers invoked for received events
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register a handler for events named `key`
    pub fn on<F>(&self, key: impl Into<String>, handler: F) -> HandlerRef
    where
        F: Fn(&EventData) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.on(key, handler)
    }

    /// Remove a handler previously returned by [`RelayClient::on`]
    pub fn off(&self, key: &str, handler: &HandlerRef) {
        self.dispatcher.off(key, handler)
    }

    /// Connect to the relay and start the receive loop.
    ///
    /// A failed attempt leaves the client `Closed`; nothing is retried.
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        {
            let mut state = self.state.write().await;
            if matches!(*state, ClientState::Connecting | ClientState::Connected) {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ClientState::Connecting;
        }

        tracing::info!("Connecting to {}", server_addr);

        let stream = match tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!("Failed to connect: {}", e);
                *self.state.write().await = ClientState::Closed;
                return Err(ClientError::Connect {
                    addr: server_addr.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                tracing::error!("Failed to connect: timed out");
                *self.state.write().await = ClientState::Closed;
                return Err(ClientError::Timeout);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        *self.state.write().await = ClientState::Connected;

        tracing::info!("Connected to server at {}", server_addr);
        let _ = self.event_tx.try_send(ClientEvent::Connected { server_addr });

        let mut frames = FrameReader::with_read_size(reader, self.config.read_buffer_size);
        let dispatcher = self.dispatcher.clone();
        let state = self.state.clone();
        let writer = self.writer.clone();
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            let reason = match receive_loop(&mut frames, &dispatcher).await {
                Ok(count) => {
                    tracing::info!("Server closed the connection after {} event(s)", count);
                    "Connection closed".to_string()
                }
                Err(e) => {
                    tracing::error!("Receive loop failed: {}", e);
                    format!("Error: {}", e)
                }
            };

            if let Some(mut w) = writer.lock().await.take() {
                let _ = w.shutdown().await;
            }
            *state.write().await = ClientState::Closed;
            let _ = event_tx.try_send(ClientEvent::Disconnected { reason });
        });

        let previous = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        Ok(())
    }

    /// Connect to the relay by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<()> {
        match super::resolve_host(hostname, port).await {
            Ok(addr) => self.connect(addr).await,
            Err(e) => {
                tracing::error!("Failed to resolve {}: {}", hostname, e);
                *self.state.write().await = ClientState::Closed;
                Err(ClientError::Connect {
                    addr: format!("{}:{}", hostname, port),
                    source: e,
                })
            }
        }
    }

    /// Connect using the host and port from the configuration
    pub async fn connect_configured(&self) -> ClientResult<()> {
        let host = self.config.host.clone();
        self.connect_hostname(&host, self.config.port).await
    }

    /// Serialize `data` as JSON and send it under `key`
    pub async fn send<T>(&self, key: &str, data: &T) -> ClientResult<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(data)?;
        self.send_bytes(key, payload).await
    }

    /// Send an opaque payload under `key`, returning once it is flushed
    pub async fn send_bytes(&self, key: &str, payload: impl Into<bytes::Bytes>) -> ClientResult<()> {
        let frame = Frame::new(key, payload)?;
        let bytes = frame.to_bytes();

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!("Sent event '{}' ({} bytes)", key, bytes.len());
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to send event '{}': {}", key, e);
                guard.take();
                drop(guard);
                self.abort_receive_loop();
                *self.state.write().await = ClientState::Closed;
                let _ = self.event_tx.try_send(ClientEvent::Disconnected {
                    reason: format!("Send error: {}", e),
                });
                Err(ClientError::Io(e))
            }
        }
    }

    /// Close the connection; safe to call in any state and more than once
    pub async fn close(&self) {
        self.abort_receive_loop();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
            tracing::info!("Connection closed");
            let _ = self.event_tx.try_send(ClientEvent::Disconnected {
                reason: "Client closed".to_string(),
            });
        }

        *self.state.write().await = ClientState::Closed;
    }

    fn abort_receive_loop(&self) {
        let task = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Get the current state
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Connected
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.abort_receive_loop();
    }
}

/// Decode frames until the stream ends and fire each on `dispatcher`.
///
/// Returns the number of frames dispatched. A payload that is not valid
/// JSON is logged and skipped; codec errors end the loop.
pub async fn receive_loop<R>(frames: &mut FrameReader<R>, dispatcher: &Dispatcher) -> CodecResult<usize>
where
    R: AsyncRead + Unpin,
{
    let mut count = 0;

    while let Some(frame) = frames.read_frame().await? {
        let (key, payload) = frame.into_parts();

        let data = if payload.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice::<Value>(&payload) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Dropping event '{}' with invalid payload: {}", key, e);
                    continue;
                }
            }
        };

        tracing::debug!("Received event '{}'", key);
        dispatcher.fire(&key, &data);
        count += 1;
    }

    Ok(count)
}
