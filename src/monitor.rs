//! Backup failure monitoring.
//!
//! Watches the server list for crashed backups and informs the replica
//! manager, which re-replicates the affected segments. Runs on its own
//! thread so corrective action starts immediately and can take its time
//! even while the master is otherwise idle.
//!
//! Logically part of the replication layer; only the membership surface
//! and the two seams below are consumed here.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::cluster::{ServerEvent, ServerList, ServerTracker};
use crate::error::Result;
use crate::types::{SegmentId, ServerId, ServiceMask};

/// The replication layer's corrective surface.
pub trait ReplicaManager: Send + Sync {
    /// Take corrective action for a failed backup. Returns the id of
    /// the open head segment that lost a replica, if any; the caller
    /// must then roll the log over to a fresh head.
    fn handle_backup_failure(&self, backup_id: ServerId) -> Result<Option<SegmentId>>;
}

/// The log head, seen narrowly.
pub trait HeadLog: Send + Sync {
    /// Allocate a new head segment so new writes stop depending on a
    /// lost replica.
    fn roll_over_head(&self);
}

struct MonitorState {
    /// Set by `start`/`halt`; the worker exits when cleared. Changes
    /// are announced through `changes_or_exit`.
    running: bool,
}

/// Waits for backup failure notifications from the server list and
/// dispatches corrective actions.
pub struct BackupFailureMonitor {
    replica_manager: Arc<dyn ReplicaManager>,
    log: Arc<dyn HeadLog>,
    /// Receives change notifications from the server list. The worker
    /// is the only thread draining it.
    tracker: Arc<ServerTracker>,
    state: Mutex<MonitorState>,
    /// Wakes the worker when `running` changes or tracker changes are
    /// enqueued.
    changes_or_exit: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BackupFailureMonitor {
    /// Create a monitor and register its tracker with the server list.
    /// The worker does not run until [`BackupFailureMonitor::start`].
    pub fn new(
        server_list: &ServerList,
        replica_manager: Arc<dyn ReplicaManager>,
        log: Arc<dyn HeadLog>,
    ) -> Arc<Self> {
        let tracker = ServerTracker::new();
        let monitor = Arc::new(Self {
            replica_manager,
            log,
            tracker: Arc::clone(&tracker),
            state: Mutex::new(MonitorState { running: false }),
            changes_or_exit: Condvar::new(),
            thread: Mutex::new(None),
        });

        // The listener must be in place before registration: bringing
        // the tracker up to date enqueues a change per known server.
        let weak = Arc::downgrade(&monitor);
        tracker.set_listener(move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.tracker_changes_enqueued();
            }
        });
        server_list.register_tracker(&tracker);
        monitor
    }

    /// Spawn the worker. Must not be called again until after
    /// [`BackupFailureMonitor::halt`].
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        debug_assert!(!state.running, "start() without an intervening halt()");
        if state.running {
            return;
        }
        state.running = true;
        drop(state);

        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("backup-failure-monitor".to_string())
            .spawn(move || {
                this.run();
            })
            .expect("failed to spawn backup failure monitor thread");
        *self.thread.lock() = Some(handle);
    }

    /// Stop the worker and join it. Idempotent.
    pub fn halt(&self) {
        {
            let mut state = self.state.lock();
            state.running = false;
            self.changes_or_exit.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Signal the worker that tracker changes are waiting. Safe to call
    /// from the membership-gossip thread; never blocks on the worker.
    pub fn tracker_changes_enqueued(&self) {
        let _state = self.state.lock();
        self.changes_or_exit.notify_one();
    }

    fn run(&self) {
        loop {
            {
                let mut state = self.state.lock();
                while state.running && !self.tracker.has_pending_changes() {
                    self.changes_or_exit.wait(&mut state);
                }
                if !state.running {
                    return;
                }
            }

            while let Some(change) = self.tracker.poll_change() {
                if change.event != ServerEvent::Crashed
                    || !change.details.services.has(ServiceMask::BACKUP)
                {
                    continue;
                }
                let failed_id = change.details.server_id;
                debug!("backup {} failed, notifying replica manager", failed_id);
                match self.replica_manager.handle_backup_failure(failed_id) {
                    Ok(Some(head_segment_id)) => {
                        debug!(
                            "backup {} held a replica of open head segment {}, \
                             rolling the log over",
                            failed_id, head_segment_id
                        );
                        self.log.roll_over_head();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            "replica manager failed to handle failure of \
                             backup {}: {}",
                            failed_id, e
                        );
                    }
                }
            }
        }
    }
}

impl Drop for BackupFailureMonitor {
    fn drop(&mut self) {
        self.halt();
    }
}
