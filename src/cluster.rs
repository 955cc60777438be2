//! Cluster membership surface.
//!
//! The authoritative membership list lives outside this crate (it is
//! maintained by gossip); what the storage core consumes is a
//! [`ServerList`] that publishes add/crash/remove events to registered
//! [`ServerTracker`]s. Each tracker keeps its own applied view plus a
//! queue of not-yet-processed changes, so consumers (the backup failure
//! monitor, the recovery manager) drain membership changes at their own
//! pace on their own threads.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::{ServerId, ServiceMask};

/// What the cluster knows about one server.
#[derive(Debug, Clone)]
pub struct ServerDetails {
    /// The server's id.
    pub server_id: ServerId,
    /// Services the server runs.
    pub services: ServiceMask,
    /// Benchmarked replica read speed, used to order replay scripts.
    pub expected_read_mbs: u32,
}

/// Membership event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Server joined the cluster.
    Added,
    /// Server stopped responding and was marked crashed.
    Crashed,
    /// Server's state was fully cleaned up and its slot retired.
    Removed,
}

/// One membership change delivered to a tracker.
#[derive(Debug, Clone)]
pub struct ServerChange {
    /// Details of the affected server.
    pub details: ServerDetails,
    /// What happened to it.
    pub event: ServerEvent,
}

/// Liveness of a server in a tracker's applied view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerLiveness {
    Up,
    Crashed,
}

#[derive(Default)]
struct TrackerState {
    view: HashMap<ServerId, (ServerDetails, ServerLiveness)>,
    pending: VecDeque<ServerChange>,
}

/// A consumer-side view of the server list.
///
/// Changes are enqueued by the [`ServerList`] and applied to the view
/// when the consumer calls [`ServerTracker::poll_change`]. A listener
/// hook fires on every enqueue so a sleeping consumer can be woken.
pub struct ServerTracker {
    state: Mutex<TrackerState>,
    listener: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl ServerTracker {
    /// Create a tracker with an empty view.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState::default()),
            listener: Mutex::new(None),
        })
    }

    /// Install the hook fired whenever a change is enqueued. The hook
    /// runs on the enqueuing thread and must not block.
    pub fn set_listener<F: Fn() + Send + Sync + 'static>(&self, listener: F) {
        *self.listener.lock() = Some(Box::new(listener));
    }

    /// Check whether changes are waiting to be applied.
    pub fn has_pending_changes(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Apply the next pending change to the view and return it, or
    /// `None` when the queue is drained.
    pub fn poll_change(&self) -> Option<ServerChange> {
        let mut state = self.state.lock();
        let change = state.pending.pop_front()?;
        match change.event {
            ServerEvent::Added => {
                state.view.insert(
                    change.details.server_id,
                    (change.details.clone(), ServerLiveness::Up),
                );
            }
            ServerEvent::Crashed => {
                if let Some(entry) = state.view.get_mut(&change.details.server_id) {
                    entry.1 = ServerLiveness::Crashed;
                }
            }
            ServerEvent::Removed => {
                state.view.remove(&change.details.server_id);
            }
        }
        Some(change)
    }

    /// All live servers in the applied view running every service in
    /// `services`.
    pub fn servers_with_service(&self, services: ServiceMask) -> Vec<ServerId> {
        let state = self.state.lock();
        let mut servers: Vec<ServerId> = state
            .view
            .values()
            .filter(|(details, liveness)| {
                *liveness == ServerLiveness::Up && details.services.has(services)
            })
            .map(|(details, _)| details.server_id)
            .collect();
        servers.sort();
        servers
    }

    /// Details for a server in the applied view.
    pub fn details(&self, server_id: ServerId) -> Option<ServerDetails> {
        self.state
            .lock()
            .view
            .get(&server_id)
            .map(|(details, _)| details.clone())
    }

    fn enqueue(&self, change: ServerChange) {
        self.state.lock().pending.push_back(change);
        if let Some(listener) = self.listener.lock().as_ref() {
            listener();
        }
    }
}

#[derive(Default)]
struct ListState {
    servers: HashMap<ServerId, ServerDetails>,
    trackers: Vec<Weak<ServerTracker>>,
}

/// The membership list as seen by this process.
///
/// Every mutation is broadcast as a [`ServerChange`] to all registered
/// trackers. Trackers registered late are brought up to date with
/// synthetic `Added` events for every server already present.
#[derive(Default)]
pub struct ServerList {
    state: Mutex<ListState>,
}

impl ServerList {
    /// Create an empty server list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracker to receive all future changes, preceded by
    /// `Added` events for every server currently in the list.
    pub fn register_tracker(&self, tracker: &Arc<ServerTracker>) {
        let mut state = self.state.lock();
        for details in state.servers.values() {
            tracker.enqueue(ServerChange {
                details: details.clone(),
                event: ServerEvent::Added,
            });
        }
        state.trackers.push(Arc::downgrade(tracker));
    }

    /// Add a server and broadcast the change.
    pub fn add(&self, details: ServerDetails) {
        let mut state = self.state.lock();
        state.servers.insert(details.server_id, details.clone());
        Self::broadcast(&mut state, details, ServerEvent::Added);
    }

    /// Mark a server crashed and broadcast the change. The entry stays
    /// in the list until removed.
    pub fn crash(&self, server_id: ServerId) {
        let mut state = self.state.lock();
        if let Some(details) = state.servers.get(&server_id).cloned() {
            Self::broadcast(&mut state, details, ServerEvent::Crashed);
        }
    }

    /// Remove a server entirely and broadcast the change.
    pub fn remove(&self, server_id: ServerId) {
        let mut state = self.state.lock();
        if let Some(details) = state.servers.remove(&server_id) {
            Self::broadcast(&mut state, details, ServerEvent::Removed);
        }
    }

    fn broadcast(state: &mut ListState, details: ServerDetails, event: ServerEvent) {
        state.trackers.retain(|tracker| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.enqueue(ServerChange {
                    details: details.clone(),
                    event,
                });
                true
            } else {
                false
            }
        });
    }
}
