//! Typed pub/sub between the realtime core and its consumers.
//!
//! The connection actor publishes lifecycle and order events; the UI layer and
//! the location reporter subscribe per [`EventKind`]. Listeners run inline on
//! the publishing actor, so they must be quick and must not block.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sonic_rs::Value;
use tracing::error;

/// Events emitted by the realtime core.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    ConnectionStatus { connected: bool },
    /// `data` of an `order_assigned` message, forwarded verbatim.
    OrderAssigned(Value),
    OrderCancelled(Value),
    OrderUnassigned(Value),
    Error(ErrorEvent),
}

impl DriverEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DriverEvent::ConnectionStatus { .. } => EventKind::ConnectionStatus,
            DriverEvent::OrderAssigned(_) => EventKind::OrderAssigned,
            DriverEvent::OrderCancelled(_) => EventKind::OrderCancelled,
            DriverEvent::OrderUnassigned(_) => EventKind::OrderUnassigned,
            DriverEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionStatus,
    OrderAssigned,
    OrderCancelled,
    OrderUnassigned,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ConnectionStatus => "connection_status",
            EventKind::OrderAssigned => "order_assigned",
            EventKind::OrderCancelled => "order_cancelled",
            EventKind::OrderUnassigned => "order_unassigned",
            EventKind::Error => "error",
        }
    }
}

/// Error conditions reported on the `error` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingToken,
    SessionExpired,
    TokenRefreshFailed,
    DuplicateSession,
    MaxReconnectAttempts,
    LocationUnavailable,
}

impl ErrorKind {
    /// Stable code shared with the UI layer.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::MissingToken => "NO_TOKEN",
            ErrorKind::SessionExpired => "TOKEN_EXPIRED",
            ErrorKind::TokenRefreshFailed => "TOKEN_REFRESH_ERROR",
            ErrorKind::DuplicateSession => "DUPLICATE_CONNECTION",
            ErrorKind::MaxReconnectAttempts => "MAX_RECONNECT_ATTEMPTS",
            ErrorKind::LocationUnavailable => "LOCATION_UNAVAILABLE",
        }
    }

    /// Fatal errors are never retried automatically.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::LocationUnavailable)
    }

    fn default_message(self) -> &'static str {
        match self {
            ErrorKind::MissingToken => "No authentication token found",
            ErrorKind::SessionExpired => "Session expired. Please login again.",
            ErrorKind::TokenRefreshFailed => "Authentication error. Please login again.",
            ErrorKind::DuplicateSession => "You are logged in from another device",
            ErrorKind::MaxReconnectAttempts => {
                "Unable to connect to server. Please check your internet connection."
            }
            ErrorKind::LocationUnavailable => "Location updates could not be restarted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.default_message().to_string(),
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

/// Handle returned by [`EventBus::on`]; pass it to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&DriverEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

/// Cloneable listener registry shared by the core and its consumers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&DriverEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.lock();
        registry
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns false when it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let mut removed = false;
        for listeners in registry.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|(existing, _)| *existing != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock()
            .listeners
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver an event to every listener of its kind.
    ///
    /// Listeners are snapshotted first so they may call `on`/`off` themselves.
    /// A panicking listener is logged and skipped.
    pub fn emit(&self, event: DriverEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = {
            let registry = self.lock();
            match registry.listeners.get(&kind) {
                Some(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(event = kind.as_str(), "event listener panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // A listener panic never happens under this lock, poisoning only
        // comes from a panic inside on/off bookkeeping itself.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        let counts: Vec<(&'static str, usize)> = registry
            .listeners
            .iter()
            .map(|(kind, listeners)| (kind.as_str(), listeners.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}
