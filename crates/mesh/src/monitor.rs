//! Connection event fan-out to scope-filtered subscribers.
//!
//! Subscribers receive events over unbounded channels. A new subscriber is
//! first sent an [`MonitorEventKind::InitialStateTransfer`] carrying every
//! established connection it is allowed to see. Subscribers whose receiver
//! has been dropped are pruned on the next publish.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Connection;

/// Event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorEventKind {
    /// Snapshot sent once to a new subscriber.
    InitialStateTransfer,
    /// Connections established or healed.
    Update,
    /// Connections removed.
    Delete,
}

/// One monitor notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub kind: MonitorEventKind,
    pub connections: Vec<Connection>,
    pub timestamp: DateTime<Utc>,
}

impl MonitorEvent {
    fn new(kind: MonitorEventKind, connections: Vec<Connection>) -> Self {
        Self {
            kind,
            connections,
            timestamp: Utc::now(),
        }
    }
}

/// Prefix filter over the manager names of a connection path.
///
/// An empty selector matches everything. An empty name matches any manager
/// at that position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSelector {
    #[serde(default)]
    pub path: Vec<String>,
}

impl ScopeSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn path<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        let hops: Vec<&str> = connection.path.manager_names().collect();
        if self.path.len() > hops.len() {
            return false;
        }
        self.path
            .iter()
            .zip(hops)
            .all(|(want, have)| want.is_empty() || want == have)
    }
}

struct Subscriber {
    selector: ScopeSelector,
    sender: mpsc::UnboundedSender<MonitorEvent>,
}

#[derive(Default)]
struct MonitorState {
    established: BTreeMap<String, Connection>,
    subscribers: Vec<Subscriber>,
}

impl MonitorState {
    fn publish(&mut self, kind: MonitorEventKind, connection: &Connection) {
        self.subscribers.retain(|s| !s.sender.is_closed());
        let mut delivered = 0usize;
        for subscriber in self.subscribers.iter().filter(|s| s.selector.matches(connection)) {
            if subscriber
                .sender
                .send(MonitorEvent::new(kind, vec![connection.clone()]))
                .is_ok()
            {
                delivered += 1;
            }
        }
        tracing::debug!(?kind, connection_id = %connection.id, delivered, "monitor event published");
    }
}

/// Publishes connection events and remembers the established set.
///
/// The established set and the subscriber list share one lock, so a new
/// subscriber sees every connection exactly once: in its initial state or as
/// a later event.
#[derive(Default)]
pub struct MonitorPublisher {
    state: Mutex<MonitorState>,
}

impl std::fmt::Debug for MonitorPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MonitorPublisher")
            .field("established", &state.established.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl MonitorPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and sends it the initial state.
    pub fn subscribe(&self, selector: ScopeSelector) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let snapshot = state
            .established
            .values()
            .filter(|c| selector.matches(c))
            .cloned()
            .collect();
        // Receiver is alive; the send cannot fail.
        let _ = sender.send(MonitorEvent::new(
            MonitorEventKind::InitialStateTransfer,
            snapshot,
        ));
        state.subscribers.push(Subscriber { selector, sender });
        receiver
    }

    /// Publishes an update for `connection`.
    pub fn update(&self, connection: &Connection) {
        let mut state = self.state.lock();
        state
            .established
            .insert(connection.id.clone(), connection.clone());
        state.publish(MonitorEventKind::Update, connection);
    }

    /// Publishes a delete for `connection`.
    pub fn delete(&self, connection: &Connection) {
        let mut state = self.state.lock();
        state.established.remove(&connection.id);
        state.publish(MonitorEventKind::Delete, connection);
    }

    /// Established connections, ordered by id.
    pub fn established(&self) -> Vec<Connection> {
        self.state.lock().established.values().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}
