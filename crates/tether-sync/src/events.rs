//! Event delivery to application listeners.
//!
//! The engine owns one [`ListenerRegistry`]; everything else sees events
//! only through the [`Subscription`] handed back by `subscribe`. Delivery
//! is best-effort over bounded channels: a closed receiver is pruned on the
//! next broadcast, a full one drops that event for that listener.

use tether_core::{AppKey, DataItemRecord, NodeId};
use tokio::sync::mpsc;

/// How many undelivered events one subscription may buffer.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// A change surfaced to applications.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A data item changed, became ready, or was deleted.
    DataChanged { record: DataItemRecord },

    /// A peer session became active.
    PeerConnected { node: NodeId },

    /// A peer session closed.
    PeerDisconnected { node: NodeId },

    /// An RPC-style message arrived for a local application.
    MessageReceived {
        app: AppKey,
        source: NodeId,
        path: String,
        payload: Vec<u8>,
        request_id: i64,
    },
}

/// Discriminant of an [`Event`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataChanged,
    PeerConnected,
    PeerDisconnected,
    MessageReceived,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DataChanged { .. } => EventKind::DataChanged,
            Event::PeerConnected { .. } => EventKind::PeerConnected,
            Event::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Event::MessageReceived { .. } => EventKind::MessageReceived,
        }
    }

    /// The application this event belongs to, when it has one. Peer
    /// lifecycle events belong to everyone.
    fn app(&self) -> Option<&AppKey> {
        match self {
            Event::DataChanged { record } => Some(&record.app),
            Event::MessageReceived { app, .. } => Some(app),
            Event::PeerConnected { .. } | Event::PeerDisconnected { .. } => None,
        }
    }

    fn path(&self) -> Option<&str> {
        match self {
            Event::DataChanged { record } => Some(record.uri.path()),
            Event::MessageReceived { path, .. } => Some(path),
            Event::PeerConnected { .. } | Event::PeerDisconnected { .. } => None,
        }
    }
}

/// Selects which events a subscription receives.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Limit item and message events to one application. `None` passes
    /// every application.
    pub app: Option<AppKey>,

    /// Event kinds to deliver. Empty delivers every kind.
    pub kinds: Vec<EventKind>,

    /// Path prefix for item and message events. Empty matches every path.
    pub path_prefix: String,
}

impl EventFilter {
    /// Everything, unfiltered.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every event for one application.
    pub fn for_app(app: AppKey) -> Self {
        Self {
            app: Some(app),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind()) {
            return false;
        }
        if let Some(want) = &self.app {
            match event.app() {
                Some(app) if app == want => {}
                Some(_) => return false,
                None => {}
            }
        }
        if !self.path_prefix.is_empty() {
            match event.path() {
                Some(path) if path.starts_with(&self.path_prefix) => {}
                Some(_) => return false,
                None => {}
            }
        }
        true
    }
}

/// Handle identifying one registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A registered listener's receiving end.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<Event>,
}

struct Listener {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

/// All registered listeners. Owned by the engine task.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    listeners: Vec<Listener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, filter: EventFilter) -> Subscription {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.listeners.push(Listener { id, filter, tx });
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    /// Deliver to every matching listener, pruning dead ones.
    pub fn broadcast(&mut self, event: &Event) {
        self.listeners.retain(|listener| {
            if !listener.filter.matches(event) {
                return true;
            }
            match listener.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(id = %listener.id, "listener queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(id = %listener.id, "pruning dead listener");
                    false
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
