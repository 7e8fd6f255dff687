//! Connection registry
//!
//! Tracks every open relay connection and fans bytes out to all of them
//! except the sender. Each connection owns a bounded outbound queue drained
//! by its writer task, so one slow or dead peer never blocks the others.
//!
//! Relayed chunks do not line up with frame boundaries. A peer that cannot
//! take a chunk is disconnected rather than skipped, so no peer ever sees a
//! stream with a gap in it.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;

use super::connection::{ConnectionHandle, ConnectionId};

/// Outcome of a single broadcast
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the bytes were queued for
    pub delivered: usize,
    /// Connections whose queue was full; they were disconnected
    pub dropped: usize,
    /// Connections found closed and removed
    pub removed: usize,
}

/// The set of currently open connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    /// Set by `close_all`; only changed while the write lock is held
    closed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Returns false, dropping the handle, once the
    /// registry has been closed.
    pub async fn add(&self, handle: ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        if self.closed.load(Ordering::SeqCst) {
            handle.mark_disconnected();
            return false;
        }
        connections.insert(handle.id(), handle);
        true
    }

    /// Accept connections again after `close_all`
    pub async fn reopen(&self) {
        let _connections = self.connections.write().await;
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Whether `close_all` has shut the registry
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove a connection; removing an absent id is a no-op
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.write().await.remove(&id);
        if let Some(handle) = &removed {
            handle.mark_disconnected();
        }
        removed
    }

    /// Queue `data` for every connection except `exclude`.
    ///
    /// Failures are isolated per connection. A connection whose queue is
    /// full or closed is removed after the pass; removal ends its writer
    /// once the chunks already queued are flushed.
    pub async fn broadcast(&self, data: Bytes, exclude: Option<ConnectionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut overflowed = Vec::new();
        let mut closed = Vec::new();

        {
            let connections = self.connections.read().await;
            for (id, handle) in connections.iter() {
                if Some(*id) == exclude {
                    continue;
                }

                match handle.try_send(data.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            "Outbound queue full for {} ({}), disconnecting slow peer",
                            handle.addr(),
                            id
                        );
                        overflowed.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::warn!("Connection {} ({}) is closed, scheduling removal", handle.addr(), id);
                        closed.push(*id);
                    }
                }
            }
        }

        for id in overflowed {
            if self.remove(id).await.is_some() {
                report.dropped += 1;
            }
        }
        for id in closed {
            if self.remove(id).await.is_some() {
                report.removed += 1;
            }
        }

        report
    }

    /// Disconnect every connection, ending their writer tasks, and refuse
    /// further `add`s until `reopen`
    pub async fn close_all(&self) -> usize {
        let mut connections = self.connections.write().await;
        self.closed.store(true, Ordering::SeqCst);
        let count = connections.len();
        for (_, handle) in connections.drain() {
            handle.mark_disconnected();
        }
        count
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Decoder};
    use bytes::BytesMut;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn peer(port: u16, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(addr, tx), rx)
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = peer(1001, 8);
        let (b, mut rx_b) = peer(1002, 8);
        let (c, mut rx_c) = peer(1003, 8);
        let sender = a.id();

        registry.add(a).await;
        registry.add(b).await;
        registry.add(c).await;

        let report = registry.broadcast(Bytes::from_static(b"hello"), Some(sender)).await;
        assert_eq!(report.delivered, 2);

        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(rx_c.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_connection_broadcast_delivers_nothing() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = peer(1001, 8);
        let sender = a.id();
        registry.add(a).await;

        let report = registry.broadcast(Bytes::from_static(b"x"), Some(sender)).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = peer(1001, 8);
        let (b, _rx_b) = peer(1002, 8);
        let id = a.id();
        registry.add(a).await;
        registry.add(b).await;

        assert!(registry.remove(id).await.is_some());
        assert_eq!(registry.len().await, 1);
        assert!(registry.remove(id).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_removed() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = peer(1001, 8);
        let (b, rx_b) = peer(1002, 8);
        let (c, mut rx_c) = peer(1003, 8);
        let sender = a.id();
        let dead = b.id();
        registry.add(a).await;
        registry.add(b).await;
        registry.add(c).await;

        drop(rx_b);
        let report = registry.broadcast(Bytes::from_static(b"one"), Some(sender)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert!(!registry.contains(dead).await);
        assert_eq!(registry.len().await, 2);

        let report = registry.broadcast(Bytes::from_static(b"two"), Some(sender)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 0);

        assert_eq!(rx_c.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx_c.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_full_queue_disconnects_slow_peer() {
        let registry = ConnectionRegistry::new();
        let (slow, mut rx_slow) = peer(1001, 1);
        let (fast, mut rx_fast) = peer(1002, 8);
        let slow_id = slow.id();
        registry.add(slow).await;
        registry.add(fast).await;

        registry.broadcast(Bytes::from_static(b"1"), None).await;
        let report = registry.broadcast(Bytes::from_static(b"2"), None).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert!(!registry.contains(slow_id).await);
        assert_eq!(registry.len().await, 1);

        // Already queued bytes are kept, then the queue ends.
        assert_eq!(rx_slow.recv().await.unwrap(), Bytes::from_static(b"1"));
        assert!(rx_slow.recv().await.is_none());
        assert_eq!(rx_fast.recv().await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(rx_fast.recv().await.unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_overflow_never_leaves_gap_in_frame_stream() {
        let registry = ConnectionRegistry::new();
        let (slow, mut rx_slow) = peer(1001, 1);
        registry.add(slow).await;

        let one = encode("message", br#"{"message":"one"}"#).unwrap();
        let two = encode("message", br#"{"message":"two"}"#).unwrap();

        // A frame split across two reads overflows the queue halfway.
        registry.broadcast(one.slice(..5), None).await;
        let report = registry.broadcast(one.slice(5..), None).await;
        assert_eq!(report.dropped, 1);
        registry.broadcast(two, None).await;

        let mut received = BytesMut::new();
        while let Some(chunk) = rx_slow.recv().await {
            received.extend_from_slice(&chunk);
        }

        // The peer sees a clean prefix and then end of stream, never a
        // later frame spliced onto the cut one.
        assert_eq!(&received[..], &one[..5]);
        let mut decoder = Decoder::new();
        assert!(decoder.decode(&mut received).unwrap().is_none());
        assert!(!decoder.is_idle());
    }

    #[tokio::test]
    async fn test_add_refused_after_close_all() {
        let registry = ConnectionRegistry::new();
        registry.close_all().await;
        assert!(registry.is_closed());

        let (late, mut rx_late) = peer(1001, 8);
        let handle = late.clone();
        assert!(!registry.add(late).await);
        assert!(registry.is_empty().await);
        assert!(!handle.is_connected());
        drop(handle);
        assert!(rx_late.recv().await.is_none());

        registry.reopen().await;
        let (again, _rx_again) = peer(1002, 8);
        assert!(registry.add(again).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = peer(1001, 8);
        let (b, _rx_b) = peer(1002, 8);
        let handle_a = a.clone();
        registry.add(a).await;
        registry.add(b).await;

        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty().await);
        assert!(!handle_a.is_connected());
    }
}
