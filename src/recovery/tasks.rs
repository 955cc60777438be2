//! The RPC tasks a recovery broadcasts through the parallel driver.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::parallel::ParallelTask;
use crate::rpc::{
    BackupClient, MasterClient, MasterRecoveryInfo, PendingRpc, ReplicaMapEntry,
    StartReadingDataResult,
};
use crate::types::{RecoveryId, ServerId, Tablet};

use super::tracker::RecoveryTracker;

/// Asks one backup for its replica inventory and fences out replicas
/// that may be inconsistent with the crashed master's final log.
pub(crate) struct BackupStartTask {
    backups: Arc<dyn BackupClient>,
    pub backup_id: ServerId,
    recovery_id: RecoveryId,
    crashed_server_id: ServerId,
    recovery_info: MasterRecoveryInfo,
    rpc: Option<PendingRpc<StartReadingDataResult>>,
    pub result: StartReadingDataResult,
    done: bool,
}

impl BackupStartTask {
    pub fn new(
        backups: Arc<dyn BackupClient>,
        backup_id: ServerId,
        recovery_id: RecoveryId,
        crashed_server_id: ServerId,
        recovery_info: MasterRecoveryInfo,
    ) -> Self {
        Self {
            backups,
            backup_id,
            recovery_id,
            crashed_server_id,
            recovery_info,
            rpc: None,
            result: StartReadingDataResult::empty(),
            done: false,
        }
    }

    /// Remove replicas (and the digest) that may be inconsistent with
    /// the final state of the log being recovered.
    ///
    /// When a master loses contact with a backup holding its open
    /// segment, that replica may be missing acknowledged writes. The
    /// coordinator's fence gives the minimum `(segment id, epoch)` an
    /// open replica must carry; anything below it is dropped, and a log
    /// digest read from a fenced replica is dropped with it.
    fn filter_out_invalid_replicas(&mut self) {
        let min_id = self.recovery_info.min_open_segment_id;
        let min_epoch = self.recovery_info.min_open_segment_epoch;
        let below_fence = |segment_id: u64, segment_epoch: u64| {
            segment_id < min_id || (segment_id == min_id && segment_epoch < min_epoch)
        };

        let mut kept = Vec::with_capacity(self.result.replicas.len());
        let mut kept_primaries = 0;
        for (index, replica) in self.result.replicas.iter().enumerate() {
            if !replica.closed && below_fence(replica.segment_id, replica.segment_epoch) {
                debug!(
                    "removing replica for segment {} from replica list for \
                     backup {} because it was open with <id, epoch> <{}, {}> \
                     below the required <{}, {}>",
                    replica.segment_id,
                    self.backup_id,
                    replica.segment_id,
                    replica.segment_epoch,
                    min_id,
                    min_epoch
                );
                continue;
            }
            if index < self.result.primary_replica_count {
                kept_primaries += 1;
            }
            kept.push(*replica);
        }
        self.result.replicas = kept;
        self.result.primary_replica_count = kept_primaries;

        if let Some(digest) = &self.result.log_digest {
            if below_fence(digest.segment_id, digest.segment_epoch) {
                debug!(
                    "backup {} returned a log digest for segment <{}, {}> but \
                     the minimum <id, epoch> for this master is <{}, {}>, \
                     discarding it",
                    self.backup_id,
                    digest.segment_id,
                    digest.segment_epoch,
                    min_id,
                    min_epoch
                );
                self.result.log_digest = None;
            }
        }
    }
}

impl ParallelTask for BackupStartTask {
    fn send(&mut self) {
        debug!("starting startReadingData on backup {}", self.backup_id);
        self.rpc = Some(self.backups.start_reading_data(
            self.backup_id,
            self.recovery_id,
            self.crashed_server_id,
        ));
    }

    fn is_ready(&self) -> bool {
        self.rpc.as_ref().map_or(true, |rpc| rpc.is_ready())
    }

    fn wait(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            match rpc.wait() {
                Ok(result) => self.result = result,
                // An unreachable backup is treated as one with no replicas.
                Err(e) => warn!(
                    "startReadingData failed on {}, failure was: {}",
                    self.backup_id, e
                ),
            }
        }
        self.filter_out_invalid_replicas();
        self.done = true;
        debug!(
            "backup {} has {} segment replicas",
            self.backup_id,
            self.result.replicas.len()
        );
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Sends a backup the partitioned tablet list so it can bucket replica
/// data per recovery master.
pub(crate) struct BackupPartitionTask {
    backups: Arc<dyn BackupClient>,
    backup_id: ServerId,
    recovery_id: RecoveryId,
    crashed_server_id: ServerId,
    tablets: Arc<Vec<Tablet>>,
    rpc: Option<PendingRpc<()>>,
    done: bool,
}

impl BackupPartitionTask {
    pub fn new(
        backups: Arc<dyn BackupClient>,
        backup_id: ServerId,
        recovery_id: RecoveryId,
        crashed_server_id: ServerId,
        tablets: Arc<Vec<Tablet>>,
    ) -> Self {
        Self {
            backups,
            backup_id,
            recovery_id,
            crashed_server_id,
            tablets,
            rpc: None,
            done: false,
        }
    }
}

impl ParallelTask for BackupPartitionTask {
    fn send(&mut self) {
        debug!("sending startPartitioning to {}", self.backup_id);
        self.rpc = Some(self.backups.start_partitioning(
            self.backup_id,
            self.recovery_id,
            self.crashed_server_id,
            &self.tablets,
        ));
    }

    fn is_ready(&self) -> bool {
        self.rpc.as_ref().map_or(true, |rpc| rpc.is_ready())
    }

    fn wait(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            match rpc.wait() {
                Ok(()) => debug!("backup {} started partitioning replicas", self.backup_id),
                Err(e) => warn!(
                    "startPartitioning failed on {}, failure was: {}",
                    self.backup_id, e
                ),
            }
        }
        self.done = true;
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Kicks one partition's replay off on a recovery master.
pub(crate) struct MasterStartTask {
    masters: Arc<dyn MasterClient>,
    tracker: Arc<RecoveryTracker>,
    pub server_id: ServerId,
    recovery_id: RecoveryId,
    crashed_server_id: ServerId,
    partition_id: u32,
    tablets: Vec<Tablet>,
    replica_map: Arc<Vec<ReplicaMapEntry>>,
    rpc: Option<PendingRpc<()>>,
    /// Set when the master could not be contacted; the recovery counts
    /// it as an unsuccessful recovery master after the batch.
    pub failed: bool,
    done: bool,
}

impl MasterStartTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        masters: Arc<dyn MasterClient>,
        tracker: Arc<RecoveryTracker>,
        server_id: ServerId,
        recovery_id: RecoveryId,
        crashed_server_id: ServerId,
        partition_id: u32,
        tablets: Vec<Tablet>,
        replica_map: Arc<Vec<ReplicaMapEntry>>,
    ) -> Self {
        Self {
            masters,
            tracker,
            server_id,
            recovery_id,
            crashed_server_id,
            partition_id,
            tablets,
            replica_map,
            rpc: None,
            failed: false,
            done: false,
        }
    }
}

impl ParallelTask for MasterStartTask {
    fn send(&mut self) {
        debug!(
            "starting recovery {} on recovery master {}, partition {}",
            self.recovery_id, self.server_id, self.partition_id
        );
        self.tracker.set_recovery(self.server_id, self.recovery_id);
        self.rpc = Some(self.masters.recover(
            self.server_id,
            self.recovery_id,
            self.crashed_server_id,
            self.partition_id,
            &self.tablets,
            &self.replica_map,
        ));
    }

    fn is_ready(&self) -> bool {
        self.rpc.as_ref().map_or(true, |rpc| rpc.is_ready())
    }

    fn wait(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            if let Err(e) = rpc.wait() {
                warn!(
                    "couldn't contact server {} to start recovery: {}",
                    self.server_id, e
                );
                self.failed = true;
            }
        }
        self.done = true;
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Tells one backup the recovery is over.
pub(crate) struct BackupEndTask {
    backups: Arc<dyn BackupClient>,
    backup_id: ServerId,
    crashed_server_id: ServerId,
    rpc: Option<PendingRpc<()>>,
    done: bool,
}

impl BackupEndTask {
    pub fn new(
        backups: Arc<dyn BackupClient>,
        backup_id: ServerId,
        crashed_server_id: ServerId,
    ) -> Self {
        Self {
            backups,
            backup_id,
            crashed_server_id,
            rpc: None,
            done: false,
        }
    }
}

impl ParallelTask for BackupEndTask {
    fn send(&mut self) {
        self.rpc = Some(
            self.backups
                .recovery_complete(self.backup_id, self.crashed_server_id),
        );
    }

    fn is_ready(&self) -> bool {
        self.rpc.as_ref().map_or(true, |rpc| rpc.is_ready())
    }

    fn wait(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            if let Err(e) = rpc.wait() {
                debug!(
                    "recoveryComplete failed on {}, ignoring; failure was: {}",
                    self.backup_id, e
                );
            }
        }
        self.done = true;
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{DigestInfo, ReplicaInfo};
    use crate::segment::LogDigest;

    struct NullBackupClient;

    impl BackupClient for NullBackupClient {
        fn start_reading_data(
            &self,
            _backup_id: ServerId,
            _recovery_id: RecoveryId,
            _crashed_server_id: ServerId,
        ) -> PendingRpc<StartReadingDataResult> {
            PendingRpc::ready(Ok(StartReadingDataResult::empty()))
        }

        fn start_partitioning(
            &self,
            _backup_id: ServerId,
            _recovery_id: RecoveryId,
            _crashed_server_id: ServerId,
            _tablets: &[Tablet],
        ) -> PendingRpc<()> {
            PendingRpc::ready(Ok(()))
        }

        fn recovery_complete(
            &self,
            _backup_id: ServerId,
            _crashed_server_id: ServerId,
        ) -> PendingRpc<()> {
            PendingRpc::ready(Ok(()))
        }
    }

    fn replica(segment_id: u64, segment_epoch: u64, closed: bool) -> ReplicaInfo {
        ReplicaInfo {
            segment_id,
            segment_epoch,
            closed,
        }
    }

    fn task_with_result(result: StartReadingDataResult, info: MasterRecoveryInfo) -> BackupStartTask {
        let mut task = BackupStartTask::new(
            Arc::new(NullBackupClient),
            ServerId::new(1, 0),
            7,
            ServerId::new(9, 0),
            info,
        );
        task.result = result;
        task
    }

    #[test]
    fn test_filter_drops_stale_open_replicas() {
        let info = MasterRecoveryInfo {
            min_open_segment_id: 11,
            min_open_segment_epoch: 5,
        };
        let mut task = task_with_result(
            StartReadingDataResult {
                replicas: vec![
                    replica(10, 0, true),   // closed: kept regardless
                    replica(10, 9, false),  // open below fence: dropped
                    replica(11, 4, false),  // open, epoch below fence: dropped
                    replica(11, 5, false),  // open at fence: kept
                    replica(12, 0, false),  // open above fence: kept
                ],
                primary_replica_count: 3,
                log_digest: None,
            },
            info,
        );

        task.filter_out_invalid_replicas();

        assert_eq!(
            task.result.replicas,
            vec![
                replica(10, 0, true),
                replica(11, 5, false),
                replica(12, 0, false)
            ]
        );
        // Only one of the three primaries survived the fence.
        assert_eq!(task.result.primary_replica_count, 1);
    }

    #[test]
    fn test_filter_drops_digest_from_fenced_replica() {
        let info = MasterRecoveryInfo {
            min_open_segment_id: 11,
            min_open_segment_epoch: 5,
        };
        let mut task = task_with_result(
            StartReadingDataResult {
                replicas: vec![],
                primary_replica_count: 0,
                log_digest: Some(DigestInfo {
                    segment_id: 11,
                    segment_epoch: 4,
                    digest: LogDigest::new(vec![10, 11]),
                }),
            },
            info,
        );

        task.filter_out_invalid_replicas();
        assert!(task.result.log_digest.is_none());
    }

    #[test]
    fn test_filter_keeps_digest_at_fence() {
        let info = MasterRecoveryInfo {
            min_open_segment_id: 11,
            min_open_segment_epoch: 5,
        };
        let mut task = task_with_result(
            StartReadingDataResult {
                replicas: vec![],
                primary_replica_count: 0,
                log_digest: Some(DigestInfo {
                    segment_id: 11,
                    segment_epoch: 5,
                    digest: LogDigest::new(vec![10, 11]),
                }),
            },
            info,
        );

        task.filter_out_invalid_replicas();
        assert!(task.result.log_digest.is_some());
    }
}
