//! The recovery state machine.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::error::Error;
use crate::parallel::parallel_run;
use crate::rpc::{BackupClient, MasterClient, MasterRecoveryInfo, ReplicaMapEntry, TableManager};
use crate::segment::LogDigest;
use crate::types::{RecoveryId, SegmentId, ServerId, ServiceMask, Tablet};

use super::tasks::{BackupEndTask, BackupPartitionTask, BackupStartTask, MasterStartTask};
use super::tracker::RecoveryTracker;
use super::{PartitionStrategy, RecoveryStatus};

/// Shared collaborators a recovery works through.
#[derive(Clone)]
pub struct RecoveryContext {
    /// Backup-side recovery RPCs.
    pub backups: Arc<dyn BackupClient>,
    /// Recovery-master RPCs.
    pub masters: Arc<dyn MasterClient>,
    /// The coordinator's tablet map.
    pub table_manager: Arc<dyn TableManager>,
    /// Membership view and recovery-master handles.
    pub tracker: Arc<RecoveryTracker>,
    /// Tablet partitioning policy.
    pub partition_strategy: Arc<dyn PartitionStrategy>,
    /// Cap on in-flight RPCs per broadcast.
    pub max_concurrent_rpcs: usize,
}

/// What the executor should do with a recovery after driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// More work is ready now; call `perform_task` again.
    Reschedule,
    /// Progress now comes from external completion calls.
    Waiting,
    /// The recovery is over; inspect
    /// [`Recovery::was_completely_successful`] and drop it.
    Finished,
}

/// Reconstruction of one crashed master.
///
/// Constructed by the recovery manager and advanced one state at a time
/// through [`Recovery::perform_task`] on the manager's thread. External
/// completion reports arrive through
/// [`Recovery::recovery_master_finished`].
pub struct Recovery {
    context: RecoveryContext,
    crashed_server_id: ServerId,
    master_recovery_info: MasterRecoveryInfo,
    recovery_id: RecoveryId,
    status: RecoveryStatus,
    /// The crashed master's tablets, each tagged with its partition.
    tablets_to_recover: Vec<Tablet>,
    /// The replay script sent to every recovery master.
    replica_map: Vec<ReplicaMapEntry>,
    num_partitions: u32,
    successful_recovery_masters: u32,
    unsuccessful_recovery_masters: u32,
}

impl Recovery {
    /// Create a recovery for `crashed_server_id`. No work happens until
    /// [`Recovery::perform_task`] is called.
    pub fn new(
        context: RecoveryContext,
        crashed_server_id: ServerId,
        master_recovery_info: MasterRecoveryInfo,
    ) -> Self {
        Self {
            context,
            crashed_server_id,
            master_recovery_info,
            recovery_id: rand::random(),
            status: RecoveryStatus::StartRecoveryOnBackups,
            tablets_to_recover: Vec::new(),
            replica_map: Vec::new(),
            num_partitions: 0,
            successful_recovery_masters: 0,
            unsuccessful_recovery_masters: 0,
        }
    }

    /// Unique identifier of this recovery attempt, used to reassociate
    /// completion RPCs from recovery masters.
    pub fn recovery_id(&self) -> RecoveryId {
        self.recovery_id
    }

    /// The master being rebuilt.
    pub fn crashed_server_id(&self) -> ServerId {
        self.crashed_server_id
    }

    /// The fence this recovery applies to open replicas.
    pub fn master_recovery_info(&self) -> MasterRecoveryInfo {
        self.master_recovery_info
    }

    /// Current state.
    pub fn status(&self) -> RecoveryStatus {
        self.status
    }

    /// Number of partitions being recovered.
    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// The replay script built during `start_backups`.
    pub fn replica_map(&self) -> &[ReplicaMapEntry] {
        &self.replica_map
    }

    /// True once every partition was recovered successfully. False
    /// while in progress, after any partition failed, or when recovery
    /// never got off the ground (no digest, incomplete log).
    pub fn was_completely_successful(&self) -> bool {
        self.status > RecoveryStatus::WaitForRecoveryMasters
            && self.unsuccessful_recovery_masters == 0
    }

    /// Perform one state transition's worth of work. Never blocks on
    /// anything but the RPC batches it issues itself.
    pub fn perform_task(&mut self) -> RecoveryStep {
        match self.status {
            RecoveryStatus::StartRecoveryOnBackups => {
                info!(
                    "starting recovery {} for crashed server {}",
                    self.recovery_id, self.crashed_server_id
                );
                self.start_backups()
            }
            RecoveryStatus::StartRecoveryMasters => self.start_recovery_masters(),
            // Driven by recovery_master_finished, not by the executor.
            RecoveryStatus::WaitForRecoveryMasters => RecoveryStep::Waiting,
            RecoveryStatus::BroadcastRecoveryComplete => {
                self.broadcast_recovery_complete();
                self.status = RecoveryStatus::Done;
                RecoveryStep::Finished
            }
            RecoveryStatus::Done => RecoveryStep::Finished,
        }
    }

    /// Build the map describing where replicas of every segment of the
    /// crashed master's log can be found, and prove the log complete.
    fn start_backups(&mut self) -> RecoveryStep {
        let mut tablets = self
            .context
            .table_manager
            .mark_recovering(self.crashed_server_id);
        if tablets.is_empty() {
            info!(
                "server {} crashed, but it had no tablets",
                self.crashed_server_id
            );
            self.status = RecoveryStatus::Done;
            return RecoveryStep::Finished;
        }

        debug!("getting segment lists from backups and preparing them for recovery");
        let backup_ids = self
            .context
            .tracker
            .servers_with_service(ServiceMask::BACKUP);

        // Broadcast 1: load replicas from storage and report inventories.
        let mut start_tasks: Vec<BackupStartTask> = backup_ids
            .iter()
            .map(|&backup_id| {
                BackupStartTask::new(
                    Arc::clone(&self.context.backups),
                    backup_id,
                    self.recovery_id,
                    self.crashed_server_id,
                    self.master_recovery_info,
                )
            })
            .collect();
        parallel_run(&mut start_tasks, self.context.max_concurrent_rpcs);

        let (head_id, digest) = match find_log_digest(&start_tasks) {
            Some(found) => found,
            None => {
                let error = Error::DigestMissing(self.crashed_server_id);
                info!("{}; will retry recovery later", error);
                return RecoveryStep::Finished;
            }
        };
        info!("segment {} is the head of the log", head_id);

        let missing = count_missing_segments(&start_tasks, &digest);
        if missing > 0 {
            let error = Error::LogIncomplete { missing };
            info!("{}; will retry recovery later", error);
            return RecoveryStep::Finished;
        }

        self.num_partitions = self.context.partition_strategy.partition(&mut tablets);
        self.tablets_to_recover = tablets;

        // Broadcast 2: hand backups the partitions so they can bucket
        // replica data per recovery master.
        let tablets_shared = Arc::new(self.tablets_to_recover.clone());
        let mut partition_tasks: Vec<BackupPartitionTask> = backup_ids
            .iter()
            .map(|&backup_id| {
                BackupPartitionTask::new(
                    Arc::clone(&self.context.backups),
                    backup_id,
                    self.recovery_id,
                    self.crashed_server_id,
                    Arc::clone(&tablets_shared),
                )
            })
            .collect();
        parallel_run(&mut partition_tasks, self.context.max_concurrent_rpcs);

        self.replica_map = build_replica_map(&start_tasks, &self.context.tracker, head_id);

        self.status = RecoveryStatus::StartRecoveryMasters;
        RecoveryStep::Reschedule
    }

    /// Start replay of each partition on a recovery master. Masters
    /// already working for another recovery are skipped; partitions
    /// with no master available are counted unsuccessful immediately so
    /// the state machine knows it will never hear about them.
    fn start_recovery_masters(&mut self) -> RecoveryStep {
        info!(
            "starting recovery {} for crashed server {} with {} partitions",
            self.recovery_id, self.crashed_server_id, self.num_partitions
        );

        let mut masters = self
            .context
            .tracker
            .servers_with_service(ServiceMask::MASTER);
        masters.shuffle(&mut rand::thread_rng());

        let replica_map = Arc::new(self.replica_map.clone());
        let mut tasks: Vec<MasterStartTask> = Vec::new();
        for master in masters {
            let partition_id = tasks.len() as u32;
            if partition_id == self.num_partitions {
                break;
            }
            if self.context.tracker.recovery_for(master).is_some() {
                continue;
            }
            let tablets: Vec<Tablet> = self
                .tablets_to_recover
                .iter()
                .filter(|tablet| tablet.partition == Some(partition_id))
                .cloned()
                .collect();
            tasks.push(MasterStartTask::new(
                Arc::clone(&self.context.masters),
                Arc::clone(&self.context.tracker),
                master,
                self.recovery_id,
                self.crashed_server_id,
                partition_id,
                tablets,
                Arc::clone(&replica_map),
            ));
        }

        let mut step = RecoveryStep::Waiting;
        let shortfall = self.num_partitions - tasks.len() as u32;
        if shortfall > 0 {
            info!(
                "couldn't find enough masters not already performing a \
                 recovery to recover all partitions: {} partitions will be \
                 recovered later",
                shortfall
            );
            for _ in 0..shortfall {
                step = self.recovery_master_finished(ServerId::INVALID, false);
            }
        }

        parallel_run(&mut tasks, self.context.max_concurrent_rpcs);
        for task in &tasks {
            if task.failed {
                step = self.recovery_master_finished(task.server_id, false);
            }
        }

        // Enough premature failures may already have pushed the status
        // past waiting; don't regress it.
        if self.status > RecoveryStatus::WaitForRecoveryMasters {
            return step;
        }
        self.status = RecoveryStatus::WaitForRecoveryMasters;
        debug!("waiting for recovery to complete on recovery masters");
        RecoveryStep::Waiting
    }

    /// Record the completion of one recovery master's partition.
    /// Idempotent per recovery master: duplicate notifications find the
    /// tracker handle already released and are ignored. An invalid
    /// server id skips the handle check entirely; it accounts for a
    /// partition no master was ever assigned.
    pub fn recovery_master_finished(
        &mut self,
        recovery_master_id: ServerId,
        successful: bool,
    ) -> RecoveryStep {
        if recovery_master_id.is_valid()
            && !self
                .context
                .tracker
                .clear_recovery_if(recovery_master_id, self.recovery_id)
        {
            return self.current_step();
        }

        if successful {
            self.successful_recovery_masters += 1;
        } else {
            self.unsuccessful_recovery_masters += 1;
            if recovery_master_id.is_valid() {
                info!(
                    "recovery master {} failed to recover its partition of \
                     crashed server {}",
                    recovery_master_id, self.crashed_server_id
                );
            }
        }

        let completed = self.successful_recovery_masters + self.unsuccessful_recovery_masters;
        if completed < self.num_partitions {
            return RecoveryStep::Waiting;
        }

        self.status = RecoveryStatus::BroadcastRecoveryComplete;
        if self.was_completely_successful() {
            RecoveryStep::Reschedule
        } else {
            debug!(
                "recovery wasn't completely successful; will not broadcast \
                 the end of recovery {} for server {} to backups",
                self.recovery_id, self.crashed_server_id
            );
            self.status = RecoveryStatus::Done;
            RecoveryStep::Finished
        }
    }

    /// Tell every backup the crashed master is recovered and its
    /// replica state can be dropped. Failures are logged and ignored.
    fn broadcast_recovery_complete(&mut self) {
        debug!(
            "broadcasting the end of recovery {} for server {} to backups",
            self.recovery_id, self.crashed_server_id
        );
        let backup_ids = self
            .context
            .tracker
            .servers_with_service(ServiceMask::BACKUP);
        let mut tasks: Vec<BackupEndTask> = backup_ids
            .into_iter()
            .map(|backup_id| {
                BackupEndTask::new(
                    Arc::clone(&self.context.backups),
                    backup_id,
                    self.crashed_server_id,
                )
            })
            .collect();
        parallel_run(&mut tasks, self.context.max_concurrent_rpcs);
    }

    fn current_step(&self) -> RecoveryStep {
        if self.status == RecoveryStatus::Done {
            RecoveryStep::Finished
        } else {
            RecoveryStep::Waiting
        }
    }
}

/// Pick the log digest to recover against: among all surviving digests,
/// the one from the replica with the lowest segment id wins. Ties are
/// broken by first encounter; replicas of one open segment carry
/// identical digests by construction.
fn find_log_digest(tasks: &[BackupStartTask]) -> Option<(SegmentId, LogDigest)> {
    let mut found: Option<(SegmentId, &LogDigest)> = None;
    for task in tasks {
        if let Some(info) = &task.result.log_digest {
            let replace = match found {
                None => true,
                Some((best_id, _)) => info.segment_id < best_id,
            };
            if replace {
                found = Some((info.segment_id, &info.digest));
            }
        }
    }
    found.map(|(segment_id, digest)| (segment_id, digest.clone()))
}

/// Count digest segments with no surviving replica on any backup. The
/// log is complete and recoverable only when this is zero.
fn count_missing_segments(tasks: &[BackupStartTask], digest: &LogDigest) -> usize {
    let mut replica_set = HashSet::new();
    for task in tasks {
        for replica in &task.result.replicas {
            replica_set.insert(replica.segment_id);
        }
    }

    let mut missing = 0;
    for &segment_id in digest.segment_ids() {
        if !replica_set.contains(&segment_id) {
            info!(
                "segment {} listed in the log digest but not found among \
                 available backups",
                segment_id
            );
            missing += 1;
        }
    }
    missing
}

/// Build the replay script sent to every recovery master.
///
/// Replicas are ordered by the time their backup is expected to have
/// them loaded: primaries are staged by position and read speed;
/// secondaries get the same staging plus a large bias so they interleave
/// after all primaries. Replicas past the chosen head segment are not
/// part of the log and are dropped.
fn build_replica_map(
    tasks: &[BackupStartTask],
    tracker: &RecoveryTracker,
    head_id: SegmentId,
) -> Vec<ReplicaMapEntry> {
    struct ReplicaAndLoadTime {
        entry: ReplicaMapEntry,
        expected_load_time_ms: u64,
    }

    let mut to_sort: Vec<ReplicaAndLoadTime> = Vec::new();
    for task in tasks {
        let speed = tracker
            .details(task.backup_id)
            .map(|details| details.expected_read_mbs as u64)
            .unwrap_or(1)
            .max(1);
        debug!(
            "adding {} segment replicas from {} with bench speed of {}",
            task.result.replicas.len(),
            task.backup_id,
            speed
        );

        let primaries = task.result.primary_replica_count;
        for (index, replica) in task.result.replicas.iter().enumerate() {
            let expected_load_time_ms = if index < primaries {
                (index as u64 + 1) * 8 * 1000 / speed
            } else {
                // Bias secondaries so they never preempt primaries but
                // still interleave among themselves.
                (index as u64 + 1 - primaries as u64) * 8 * 1000 / speed + 1_000_000
            };
            if replica.segment_id > head_id {
                debug!(
                    "ignoring replica for segment {} from backup {} because \
                     it's past the head segment ({})",
                    replica.segment_id, task.backup_id, head_id
                );
                continue;
            }
            to_sort.push(ReplicaAndLoadTime {
                entry: ReplicaMapEntry {
                    backup_id: task.backup_id,
                    segment_id: replica.segment_id,
                },
                expected_load_time_ms,
            });
        }
    }

    to_sort.sort_by_key(|replica| replica.expected_load_time_ms);
    to_sort
        .into_iter()
        .map(|replica| {
            debug!(
                "load segment {} replica from backup {} with expected load \
                 time of {} ms",
                replica.entry.segment_id, replica.entry.backup_id, replica.expected_load_time_ms
            );
            replica.entry
        })
        .collect()
}
