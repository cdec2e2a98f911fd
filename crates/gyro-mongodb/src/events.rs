//! Connection lifecycle events
//!
//! The client announces `connect`, `close`, `reconnect` and `error` events.
//! Listeners are registered per event kind with [`EventBus::on`] and removed
//! with [`EventBus::off`]; they run synchronously, in registration order.
//!
//! # Example
//! ```rust,ignore
//! use gyro_mongodb::{EventKind, Mongo};
//!
//! let mongo = Mongo::new();
//! let id = mongo.events().on(EventKind::Close, |event| {
//!     tracing::warn!(?event, "lost connection to mongodb");
//! });
//! mongo.events().off(id);
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gyro_common::GyroError;

/// Lifecycle event emitted by the client
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection to `address` was established
    Connect { address: String },
    /// The established connection to `address` was lost
    Close { address: String },
    /// The connection to `address` came back after a loss or failed attempt
    Reconnect { address: String },
    /// A connection attempt or an operation failed
    Error { error: GyroError },
}

/// Kind of a [`ConnectionEvent`], used to register listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Close,
    Reconnect,
    Error,
}

impl EventKind {
    /// Event name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Close => "close",
            EventKind::Reconnect => "reconnect",
            EventKind::Error => "error",
        }
    }
}

impl ConnectionEvent {
    /// Get the kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connect { .. } => EventKind::Connect,
            ConnectionEvent::Close { .. } => EventKind::Close,
            ConnectionEvent::Reconnect { .. } => EventKind::Reconnect,
            ConnectionEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Get the event name as a string
    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Get the address for lifecycle events
    pub fn address(&self) -> Option<&str> {
        match self {
            ConnectionEvent::Connect { address }
            | ConnectionEvent::Close { address }
            | ConnectionEvent::Reconnect { address } => Some(address),
            ConnectionEvent::Error { .. } => None,
        }
    }

    /// Get the error for `error` events
    pub fn error(&self) -> Option<&GyroError> {
        match self {
            ConnectionEvent::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Listener for lifecycle events
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn handle(&self, event: &ConnectionEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn handle(&self, event: &ConnectionEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::on`], used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    kind: EventKind,
    listener: Arc<dyn EventListener>,
}

/// Registry of event listeners
pub struct EventBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventBus {
    /// Create an empty event bus
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a closure for events of `kind`
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, listener)
    }

    /// Register a listener for events of `kind`
    pub fn add_listener<L>(&self, kind: EventKind, listener: L) -> ListenerId
    where
        L: EventListener + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration {
            id,
            kind,
            listener: Arc::new(listener),
        });
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Remove every listener for `kind`
    pub fn clear(&self, kind: EventKind) {
        self.listeners.write().retain(|registration| registration.kind != kind);
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|registration| registration.kind == kind)
            .count()
    }

    /// Deliver `event` to every listener of its kind
    pub fn emit(&self, event: &ConnectionEvent) {
        // Snapshot first so listeners may register or remove listeners themselves.
        let targets: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .iter()
            .filter(|registration| registration.kind == event.kind())
            .map(|registration| registration.listener.clone())
            .collect();

        if targets.is_empty() {
            if let ConnectionEvent::Error { error } = event {
                tracing::debug!(error = %error, "error event emitted with no listeners");
            }
            return;
        }

        for listener in targets {
            listener.handle(event);
        }
    }
}
