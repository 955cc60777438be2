//! The coordinator's recovery manager.
//!
//! Owns every [`Recovery`] and drives them all on one dedicated thread,
//! so recovery state is only ever touched from that thread. External
//! callers (the coordinator's RPC handlers, the membership layer) hand
//! work in through queued events and get woken replies back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::cluster::{ServerEvent, ServerList, ServerTracker};
use crate::metrics::RecoveryMetrics;
use crate::options::Config;
use crate::rpc::{BackupClient, MasterClient, MasterRecoveryInfo, TableManager};
use crate::types::{RecoveryId, ServerId};

use super::recovery::{Recovery, RecoveryContext, RecoveryStep};
use super::tracker::RecoveryTracker;
use super::{OneTabletPerPartition, PartitionStrategy};

enum ManagerEvent {
    StartRecovery {
        crashed_server_id: ServerId,
        recovery_info: MasterRecoveryInfo,
    },
    MasterFinished {
        recovery_id: RecoveryId,
        master_id: ServerId,
        successful: bool,
        reply: crate::rpc::RpcCompletion<bool>,
    },
}

struct ManagerState {
    running: bool,
    events: VecDeque<ManagerEvent>,
    /// Recoveries waiting for an activation slot.
    waiting: VecDeque<Recovery>,
    /// Recoveries being driven, by recovery id.
    active: HashMap<RecoveryId, Recovery>,
    /// Active recoveries with a state transition ready to run.
    scheduled: VecDeque<RecoveryId>,
}

/// Drives crash recovery of masters.
pub struct MasterRecoveryManager {
    backups: Arc<dyn BackupClient>,
    masters: Arc<dyn MasterClient>,
    table_manager: Arc<dyn TableManager>,
    partition_strategy: Arc<dyn PartitionStrategy>,
    tracker: Arc<RecoveryTracker>,
    membership: Arc<ServerTracker>,
    metrics: Arc<RecoveryMetrics>,
    max_concurrent_rpcs: usize,
    max_active_recoveries: usize,
    state: Mutex<ManagerState>,
    work_available: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MasterRecoveryManager {
    /// Create a manager and register its membership tracker with the
    /// server list. Nothing runs until [`MasterRecoveryManager::start`].
    pub fn new(
        server_list: &ServerList,
        backups: Arc<dyn BackupClient>,
        masters: Arc<dyn MasterClient>,
        table_manager: Arc<dyn TableManager>,
        config: &Config,
    ) -> Arc<Self> {
        let membership = ServerTracker::new();
        let manager = Arc::new(Self {
            backups,
            masters,
            table_manager,
            partition_strategy: Arc::new(OneTabletPerPartition),
            tracker: RecoveryTracker::new(Arc::clone(&membership)),
            membership: Arc::clone(&membership),
            metrics: Arc::new(RecoveryMetrics::new()),
            max_concurrent_rpcs: config.max_concurrent_rpcs,
            max_active_recoveries: config.max_active_recoveries,
            state: Mutex::new(ManagerState {
                running: false,
                events: VecDeque::new(),
                waiting: VecDeque::new(),
                active: HashMap::new(),
                scheduled: VecDeque::new(),
            }),
            work_available: Condvar::new(),
            thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        membership.set_listener(move || {
            if let Some(manager) = weak.upgrade() {
                let _state = manager.state.lock();
                manager.work_available.notify_one();
            }
        });
        server_list.register_tracker(&membership);
        manager
    }

    /// The manager's recovery-master bookkeeping.
    pub fn tracker(&self) -> &Arc<RecoveryTracker> {
        &self.tracker
    }

    /// Coordinator-wide recovery counters.
    pub fn metrics(&self) -> &RecoveryMetrics {
        &self.metrics
    }

    /// Spawn the coordinator thread. Must not be called again until
    /// after [`MasterRecoveryManager::halt`].
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
            .name("master-recovery-manager".to_string())
            .spawn(move || {
                this.run();
            })
            .expect("failed to spawn recovery manager thread");
        *self.thread.lock() = Some(handle);
    }

    /// Stop the coordinator thread and join it. Idempotent. Pending
    /// completion calls are answered with "abort".
    pub fn halt(&self) {
        {
            let mut state = self.state.lock();
            state.running = false;
            self.work_available.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Schedule recovery of a crashed master. The recovery starts when
    /// an activation slot frees up and no other recovery is already
    /// rebuilding the same server.
    pub fn start_master_recovery(
        &self,
        crashed_server_id: ServerId,
        recovery_info: MasterRecoveryInfo,
    ) {
        info!("scheduling recovery of master {}", crashed_server_id);
        let mut state = self.state.lock();
        state.events.push_back(ManagerEvent::StartRecovery {
            crashed_server_id,
            recovery_info,
        });
        self.work_available.notify_one();
    }

    /// Report the completion of one recovery master's partition.
    /// Returns true if the report was accepted; false tells the
    /// recovery master to abort its recovery (stale recovery id, e.g.
    /// after coordinator rollover, or manager shutdown).
    pub fn recovery_master_finished(
        &self,
        recovery_id: RecoveryId,
        master_id: ServerId,
        successful: bool,
    ) -> bool {
        let (rpc, reply) = crate::rpc::PendingRpc::pending();
        {
            let mut state = self.state.lock();
            if !state.running {
                return false;
            }
            state.events.push_back(ManagerEvent::MasterFinished {
                recovery_id,
                master_id,
                successful,
                reply,
            });
            self.work_available.notify_one();
        }
        rpc.wait().unwrap_or(false)
    }

    fn run(&self) {
        loop {
            {
                let mut state = self.state.lock();
                while state.running && !self.has_work(&state) {
                    self.work_available.wait(&mut state);
                }
                if !state.running {
                    // Anyone still waiting on a reply gets "abort".
                    for event in state.events.drain(..) {
                        if let ManagerEvent::MasterFinished { reply, .. } = event {
                            reply.complete(Ok(false));
                        }
                    }
                    return;
                }
            }

            self.apply_tracker_changes();
            self.process_events();
            self.drive_scheduled();
            self.maybe_start_recoveries();
        }
    }

    fn has_work(&self, state: &ManagerState) -> bool {
        !state.events.is_empty()
            || !state.scheduled.is_empty()
            || self.membership.has_pending_changes()
            || self.can_activate(state)
    }

    /// Check whether some waiting recovery could be activated now.
    fn can_activate(&self, state: &ManagerState) -> bool {
        state.active.len() < self.max_active_recoveries
            && state.waiting.iter().any(|waiting| {
                !state
                    .active
                    .values()
                    .any(|active| active.crashed_server_id() == waiting.crashed_server_id())
            })
    }

    /// Apply membership changes. A crash of a server holding a
    /// recovery-master handle counts as that partition failing.
    fn apply_tracker_changes(&self) {
        while let Some(change) = self.membership.poll_change() {
            if change.event != ServerEvent::Crashed {
                continue;
            }
            let crashed = change.details.server_id;
            if let Some(recovery_id) = self.tracker.recovery_for(crashed) {
                let mut state = self.state.lock();
                if let Some(recovery) = state.active.get_mut(&recovery_id) {
                    let step = recovery.recovery_master_finished(crashed, false);
                    self.metrics.recovery_master_failures.inc();
                    self.handle_step(&mut state, recovery_id, step);
                }
            }
        }
    }

    fn process_events(&self) {
        loop {
            let event = self.state.lock().events.pop_front();
            match event {
                None => return,
                Some(ManagerEvent::StartRecovery {
                    crashed_server_id,
                    recovery_info,
                }) => {
                    let recovery =
                        Recovery::new(self.context(), crashed_server_id, recovery_info);
                    self.state.lock().waiting.push_back(recovery);
                }
                Some(ManagerEvent::MasterFinished {
                    recovery_id,
                    master_id,
                    successful,
                    reply,
                }) => {
                    debug!(
                        "recovery master {} reported recovery {} {}",
                        master_id,
                        recovery_id,
                        if successful { "successful" } else { "failed" }
                    );
                    let mut state = self.state.lock();
                    match state.active.get_mut(&recovery_id) {
                        Some(recovery) => {
                            if !successful {
                                self.metrics.recovery_master_failures.inc();
                            }
                            let step = recovery.recovery_master_finished(master_id, successful);
                            self.handle_step(&mut state, recovery_id, step);
                            reply.complete(Ok(true));
                        }
                        None => {
                            warn!(
                                "recovery master {} reported completing recovery {} but \
                                 there is no ongoing recovery with that id; this should \
                                 only happen after coordinator rollover; asking recovery \
                                 master to abort this recovery",
                                master_id, recovery_id
                            );
                            reply.complete(Ok(false));
                        }
                    }
                }
            }
        }
    }

    /// Run one state transition for every scheduled recovery. The
    /// recovery is taken out of the active map while it performs so no
    /// lock is held across its RPC batches.
    fn drive_scheduled(&self) {
        loop {
            let (recovery_id, mut recovery) = {
                let mut state = self.state.lock();
                match state.scheduled.pop_front() {
                    None => return,
                    Some(recovery_id) => match state.active.remove(&recovery_id) {
                        Some(recovery) => (recovery_id, recovery),
                        None => continue,
                    },
                }
            };

            let step = recovery.perform_task();

            let mut state = self.state.lock();
            match step {
                RecoveryStep::Reschedule => {
                    state.active.insert(recovery_id, recovery);
                    state.scheduled.push_back(recovery_id);
                }
                RecoveryStep::Waiting => {
                    state.active.insert(recovery_id, recovery);
                }
                RecoveryStep::Finished => {
                    self.finish_recovery(&mut state, recovery);
                }
            }
        }
    }

    /// Activate waiting recoveries while slots allow, never two for the
    /// same crashed server at once.
    fn maybe_start_recoveries(&self) {
        let mut state = self.state.lock();
        while state.active.len() < self.max_active_recoveries {
            let position = state.waiting.iter().position(|waiting| {
                let conflict = state
                    .active
                    .values()
                    .any(|active| active.crashed_server_id() == waiting.crashed_server_id());
                if conflict {
                    debug!(
                        "delaying start of recovery of server {}; another recovery \
                         is active for the same server id",
                        waiting.crashed_server_id()
                    );
                }
                !conflict
            });
            let recovery = match position {
                Some(position) => state.waiting.remove(position).unwrap(),
                None => break,
            };
            let recovery_id = recovery.recovery_id();
            self.metrics.recoveries_started.inc();
            self.metrics.active_recoveries.inc();
            info!(
                "starting recovery of server {} (now {} active recoveries)",
                recovery.crashed_server_id(),
                state.active.len() + 1
            );
            state.active.insert(recovery_id, recovery);
            state.scheduled.push_back(recovery_id);
        }
        if !state.waiting.is_empty() {
            debug!(
                "{} recoveries blocked waiting for other recoveries",
                state.waiting.len()
            );
        }
    }

    fn handle_step(&self, state: &mut ManagerState, recovery_id: RecoveryId, step: RecoveryStep) {
        match step {
            RecoveryStep::Reschedule => state.scheduled.push_back(recovery_id),
            RecoveryStep::Waiting => {}
            RecoveryStep::Finished => {
                if let Some(recovery) = state.active.remove(&recovery_id) {
                    self.finish_recovery(state, recovery);
                }
            }
        }
    }

    /// Account for a finished recovery and retry it if it did not
    /// recover everything.
    fn finish_recovery(&self, state: &mut ManagerState, recovery: Recovery) {
        self.metrics.active_recoveries.dec();
        info!(
            "recovery {} completed for master {}",
            recovery.recovery_id(),
            recovery.crashed_server_id()
        );
        if recovery.was_completely_successful() {
            self.metrics.recoveries_successful.inc();
        } else {
            self.metrics.recoveries_failed.inc();
            info!(
                "recovery of server {} failed to recover some tablets, \
                 rescheduling another recovery",
                recovery.crashed_server_id()
            );
            state.waiting.push_back(Recovery::new(
                self.context(),
                recovery.crashed_server_id(),
                recovery.master_recovery_info(),
            ));
        }
    }

    fn context(&self) -> RecoveryContext {
        RecoveryContext {
            backups: Arc::clone(&self.backups),
            masters: Arc::clone(&self.masters),
            table_manager: Arc::clone(&self.table_manager),
            tracker: Arc::clone(&self.tracker),
            partition_strategy: Arc::clone(&self.partition_strategy),
            max_concurrent_rpcs: self.max_concurrent_rpcs,
        }
    }
}

impl Drop for MasterRecoveryManager {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ServerDetails;
    use crate::recovery::testing::{closed_replica, digest_on, MockBackupClient, MockMasterClient, MockTableManager};
    use crate::rpc::StartReadingDataResult;
    use crate::types::{ServiceMask, Tablet};
    use std::time::{Duration, Instant};

    struct ManagedCluster {
        server_list: ServerList,
        backups: Arc<MockBackupClient>,
        masters: Arc<MockMasterClient>,
        table_manager: Arc<MockTableManager>,
        manager: Arc<MasterRecoveryManager>,
    }

    impl ManagedCluster {
        fn new() -> Self {
            let server_list = ServerList::new();
            let backups = Arc::new(MockBackupClient::default());
            let masters = Arc::new(MockMasterClient::default());
            let table_manager = Arc::new(MockTableManager::default());
            let manager = MasterRecoveryManager::new(
                &server_list,
                Arc::clone(&backups) as Arc<dyn BackupClient>,
                Arc::clone(&masters) as Arc<dyn MasterClient>,
                Arc::clone(&table_manager) as Arc<dyn TableManager>,
                &Config::for_testing(),
            );
            Self {
                server_list,
                backups,
                masters,
                table_manager,
                manager,
            }
        }

        fn add_server(&self, index: u32, services: ServiceMask) -> ServerId {
            let server_id = ServerId::new(index, 0);
            self.server_list.add(ServerDetails {
                server_id,
                services,
                expected_read_mbs: 100,
            });
            server_id
        }
    }

    fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_and_halt() {
        let cluster = ManagedCluster::new();
        cluster.manager.start();
        cluster.manager.halt();
        cluster.manager.halt(); // idempotent
        cluster.manager.start(); // restart after halt
        cluster.manager.halt();
    }

    #[test]
    fn test_recovery_with_no_tablets_finishes_clean() {
        let cluster = ManagedCluster::new();
        cluster.manager.start();

        cluster
            .manager
            .start_master_recovery(ServerId::new(1, 0), MasterRecoveryInfo::default());

        let metrics = cluster.manager.metrics();
        wait_until(|| metrics.recoveries_successful.get() == 1);
        assert_eq!(metrics.recoveries_started.get(), 1);
        assert_eq!(metrics.recoveries_failed.get(), 0);
        assert_eq!(metrics.active_recoveries.get(), 0);
        cluster.manager.halt();
    }

    #[test]
    fn test_unknown_recovery_id_tells_master_to_abort() {
        let cluster = ManagedCluster::new();
        cluster.manager.start();

        let accepted =
            cluster
                .manager
                .recovery_master_finished(12345, ServerId::new(2, 0), true);
        assert!(!accepted);
        cluster.manager.halt();
    }

    #[test]
    fn test_finished_report_after_halt_is_refused() {
        let cluster = ManagedCluster::new();
        cluster.manager.start();
        cluster.manager.halt();
        assert!(!cluster
            .manager
            .recovery_master_finished(1, ServerId::new(2, 0), true));
    }

    #[test]
    fn test_full_recovery_through_manager() {
        let cluster = ManagedCluster::new();
        let crashed = ServerId::new(1, 0);
        let backup = cluster.add_server(2, ServiceMask::BACKUP);
        let master = cluster.add_server(3, ServiceMask::MASTER);
        cluster
            .table_manager
            .tablets
            .lock()
            .push(Tablet::new(0, 0, u64::MAX, crashed));
        cluster.backups.responses.lock().insert(
            backup,
            StartReadingDataResult {
                replicas: vec![closed_replica(10), closed_replica(11)],
                primary_replica_count: 2,
                log_digest: digest_on(11, &[10, 11]),
            },
        );

        cluster.manager.start();
        cluster
            .manager
            .start_master_recovery(crashed, MasterRecoveryInfo::default());

        // The recover RPC reaches the only idle master.
        wait_until(|| !cluster.masters.calls.lock().is_empty());
        let recovery_id = cluster.masters.calls.lock()[0].recovery_id;
        assert_eq!(cluster.masters.calls.lock()[0].master_id, master);

        // The master reports success; the recovery broadcasts and ends.
        assert!(cluster
            .manager
            .recovery_master_finished(recovery_id, master, true));
        let metrics = cluster.manager.metrics();
        wait_until(|| metrics.recoveries_successful.get() == 1);
        wait_until(|| !cluster.backups.complete_calls.lock().is_empty());

        // Late duplicate: the recovery is gone, the master is told to abort.
        assert!(!cluster
            .manager
            .recovery_master_finished(recovery_id, master, true));
        cluster.manager.halt();
    }

    #[test]
    fn test_failed_recovery_is_requeued() {
        let cluster = ManagedCluster::new();
        let crashed = ServerId::new(1, 0);
        // A backup exists but answers with no digest, so every attempt
        // aborts and is rescheduled.
        let backup = cluster.add_server(2, ServiceMask::BACKUP);
        cluster
            .table_manager
            .tablets
            .lock()
            .push(Tablet::new(0, 0, u64::MAX, crashed));
        cluster.backups.responses.lock().insert(
            backup,
            StartReadingDataResult {
                replicas: vec![closed_replica(10)],
                primary_replica_count: 1,
                log_digest: None,
            },
        );

        cluster.manager.start();
        cluster
            .manager
            .start_master_recovery(crashed, MasterRecoveryInfo::default());

        let metrics = cluster.manager.metrics();
        wait_until(|| metrics.recoveries_failed.get() >= 2);
        assert_eq!(metrics.recoveries_successful.get(), 0);
        cluster.manager.halt();
    }

    #[test]
    fn test_crashed_recovery_master_counts_as_failure() {
        let cluster = ManagedCluster::new();
        let crashed = ServerId::new(1, 0);
        let backup = cluster.add_server(2, ServiceMask::BACKUP);
        let master = cluster.add_server(3, ServiceMask::MASTER);
        cluster
            .table_manager
            .tablets
            .lock()
            .push(Tablet::new(0, 0, u64::MAX, crashed));
        cluster.backups.responses.lock().insert(
            backup,
            StartReadingDataResult {
                replicas: vec![closed_replica(10)],
                primary_replica_count: 1,
                log_digest: digest_on(10, &[10]),
            },
        );

        cluster.manager.start();
        cluster
            .manager
            .start_master_recovery(crashed, MasterRecoveryInfo::default());
        wait_until(|| !cluster.masters.calls.lock().is_empty());

        // The recovery master itself crashes before reporting back.
        cluster.server_list.crash(master);

        let metrics = cluster.manager.metrics();
        wait_until(|| metrics.recovery_master_failures.get() >= 1);
        wait_until(|| metrics.recoveries_failed.get() >= 1);
        cluster.manager.halt();
    }
}
