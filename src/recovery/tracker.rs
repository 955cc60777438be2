//! The recovery manager's view of the cluster.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cluster::{ServerDetails, ServerTracker};
use crate::types::{RecoveryId, ServerId, ServiceMask};

/// Membership view plus recovery-master bookkeeping.
///
/// Wraps the manager's [`ServerTracker`] and records which recovery, if
/// any, each master is currently replaying a partition for. Handles are
/// claimed when the `recover` RPC is sent and released by the matching
/// completion; a completion whose handle no longer names its recovery
/// is a stale duplicate and is ignored.
pub struct RecoveryTracker {
    membership: Arc<ServerTracker>,
    handles: Mutex<HashMap<ServerId, RecoveryId>>,
}

impl RecoveryTracker {
    /// Wrap a membership tracker.
    pub fn new(membership: Arc<ServerTracker>) -> Arc<Self> {
        Arc::new(Self {
            membership,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying membership tracker.
    pub fn membership(&self) -> &ServerTracker {
        &self.membership
    }

    /// Live servers running every service in `services`.
    pub fn servers_with_service(&self, services: ServiceMask) -> Vec<ServerId> {
        self.membership.servers_with_service(services)
    }

    /// Details for a server still in the view.
    pub fn details(&self, server_id: ServerId) -> Option<ServerDetails> {
        self.membership.details(server_id)
    }

    /// Record that `server_id` is acting as a recovery master for
    /// `recovery_id`.
    pub fn set_recovery(&self, server_id: ServerId, recovery_id: RecoveryId) {
        self.handles.lock().insert(server_id, recovery_id);
    }

    /// The recovery `server_id` is currently working for, if any.
    pub fn recovery_for(&self, server_id: ServerId) -> Option<RecoveryId> {
        self.handles.lock().get(&server_id).copied()
    }

    /// Release the handle if it still names `recovery_id`. Returns
    /// whether it did.
    pub fn clear_recovery_if(&self, server_id: ServerId, recovery_id: RecoveryId) -> bool {
        let mut handles = self.handles.lock();
        if handles.get(&server_id) == Some(&recovery_id) {
            handles.remove(&server_id);
            true
        } else {
            false
        }
    }
}
