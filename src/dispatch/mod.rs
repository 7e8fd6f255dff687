//! Event dispatch - Routes decoded events to registered handlers
//!
//! Each event key maps to an ordered list of handlers. Firing a key runs
//! every handler in registration order; a handler that fails or panics is
//! logged and skipped without affecting the others.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

/// Data passed to handlers
pub type EventData = Value;

/// A callback invoked when an event with a matching key arrives
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, data: &EventData) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&EventData) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, data: &EventData) -> anyhow::Result<()> {
        self(data)
    }
}

/// Shared handle to a registered handler; pass it back to [`Dispatcher::off`] to remove it
pub type HandlerRef = Arc<dyn Handler>;

/// Registry of event handlers keyed by event name
#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<String, Vec<HandlerRef>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<HandlerRef>>> {
        // A panicking handler never runs under this lock, but stay usable regardless.
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a closure for `key` and return its handle
    pub fn on<F>(&self, key: impl Into<String>, handler: F) -> HandlerRef
    where
        F: Fn(&EventData) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: HandlerRef = Arc::new(handler);
        self.register(key, handler.clone());
        handler
    }

    /// Append a handler to the list for `key`.
    ///
    /// The same handle may be registered several times; it then fires once
    /// per registration.
    pub fn register(&self, key: impl Into<String>, handler: HandlerRef) {
        self.lock().entry(key.into()).or_default().push(handler);
    }

    /// Remove the first registration of `handler` under `key`.
    ///
    /// Unknown keys or handlers are ignored. The key is dropped once its
    /// last handler is gone.
    pub fn off(&self, key: &str, handler: &HandlerRef) {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(key) else {
            return;
        };

        if let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) {
            list.remove(pos);
        }
        if list.is_empty() {
            handlers.remove(key);
        }
    }

    /// Remove every handler registered for `key`
    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Remove all registrations
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Invoke all handlers for `key` in registration order.
    ///
    /// Returns the number of handlers that completed successfully.
    pub fn fire(&self, key: &str, data: &EventData) -> usize {
        // Snapshot so handlers can (un)register without deadlocking.
        let handlers = match self.lock().get(key) {
            Some(list) => list.clone(),
            None => {
                tracing::trace!("No handlers for event '{}'", key);
                return 0;
            }
        };

        tracing::debug!("Firing event '{}' to {} handler(s)", key, handlers.len());

        let mut succeeded = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(data))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    tracing::error!("Error firing event '{}': {:#}", key, e);
                }
                Err(_) => {
                    tracing::error!("Handler for event '{}' panicked", key);
                }
            }
        }
        succeeded
    }

    /// Number of handlers registered for `key`
    pub fn handler_count(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    /// Whether any handler is registered for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.lock();
        let mut keys: Vec<_> = handlers
            .iter()
            .map(|(key, list)| (key.clone(), list.len()))
            .collect();
        keys.sort();
        f.debug_struct("Dispatcher").field("handlers", &keys).finish()
    }
}
