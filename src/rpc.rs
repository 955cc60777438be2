//! RPC seams consumed by the recovery coordinator.
//!
//! The transport itself lives outside this crate; recovery only needs
//! the four calls below plus a handle type that lets a batch driver
//! poll for completion. Implementations back [`PendingRpc`] with a real
//! transport session; tests complete them inline.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::segment::LogDigest;
use crate::types::{RecoveryId, SegmentEpoch, SegmentId, ServerId, Tablet};

/// The `(min_open_segment_id, min_open_segment_epoch)` fence stored
/// authoritatively by the coordinator for each master. Open replicas
/// below the fence may have missed acknowledged writes and are rejected
/// during recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasterRecoveryInfo {
    /// Smallest segment id an open replica may carry.
    pub min_open_segment_id: SegmentId,
    /// Smallest epoch an open replica of `min_open_segment_id` may carry.
    pub min_open_segment_epoch: SegmentEpoch,
}

/// One replica a backup holds for the crashed master. Primaries are
/// listed first in a backup's reply; the boundary is
/// [`StartReadingDataResult::primary_replica_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaInfo {
    /// Segment the replica belongs to.
    pub segment_id: SegmentId,
    /// Replication epoch of the replica.
    pub segment_epoch: SegmentEpoch,
    /// Whether the replica was closed when the master last wrote it.
    pub closed: bool,
}

/// A log digest found on some replica, together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestInfo {
    /// Segment the digest was read from.
    pub segment_id: SegmentId,
    /// Epoch of the replica the digest was read from.
    pub segment_epoch: SegmentEpoch,
    /// The digest itself.
    pub digest: LogDigest,
}

/// Reply to `start_reading_data`.
#[derive(Debug, Clone, Default)]
pub struct StartReadingDataResult {
    /// Replicas the backup holds for the crashed master, primaries
    /// first.
    pub replicas: Vec<ReplicaInfo>,
    /// How many leading entries of `replicas` are primaries.
    pub primary_replica_count: usize,
    /// The newest log digest the backup could find, if any.
    pub log_digest: Option<DigestInfo>,
}

impl StartReadingDataResult {
    /// An empty reply, used in place of a result from an unreachable
    /// backup.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One line of the replay script sent to recovery masters: fetch the
/// replica of `segment_id` held by `backup_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaMapEntry {
    /// Backup holding the replica.
    pub backup_id: ServerId,
    /// Segment to replay.
    pub segment_id: SegmentId,
}

/// Client for the backup-side recovery RPCs.
pub trait BackupClient: Send + Sync {
    /// Ask a backup to load every replica it holds for the crashed
    /// master and report what it has.
    fn start_reading_data(
        &self,
        backup_id: ServerId,
        recovery_id: RecoveryId,
        crashed_server_id: ServerId,
    ) -> PendingRpc<StartReadingDataResult>;

    /// Hand a backup the partitioned tablet list so it can bucket
    /// replica data per recovery master.
    fn start_partitioning(
        &self,
        backup_id: ServerId,
        recovery_id: RecoveryId,
        crashed_server_id: ServerId,
        tablets: &[Tablet],
    ) -> PendingRpc<()>;

    /// Tell a backup the crashed master has been recovered and its
    /// replica state can be discarded.
    fn recovery_complete(
        &self,
        backup_id: ServerId,
        crashed_server_id: ServerId,
    ) -> PendingRpc<()>;
}

/// Client for the recovery-master RPC.
pub trait MasterClient: Send + Sync {
    /// Ask a master to replay one partition of the crashed master's
    /// log, using the given replay script.
    fn recover(
        &self,
        master_id: ServerId,
        recovery_id: RecoveryId,
        crashed_server_id: ServerId,
        partition_id: u32,
        tablets: &[Tablet],
        replica_map: &[ReplicaMapEntry],
    ) -> PendingRpc<()>;
}

/// The coordinator's authoritative tablet map, seen narrowly.
pub trait TableManager: Send + Sync {
    /// Mark every tablet owned by the crashed master as recovering and
    /// return them.
    fn mark_recovering(&self, crashed_server_id: ServerId) -> Vec<Tablet>;
}

struct RpcShared<T> {
    slot: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

/// Handle to an in-flight RPC.
///
/// `is_ready` never blocks; `wait` blocks until the reply (or failure)
/// arrives. Timeouts are the transport's concern.
pub struct PendingRpc<T> {
    shared: Arc<RpcShared<T>>,
}

impl<T> PendingRpc<T> {
    /// An RPC that already completed with `result`. Used by synchronous
    /// transports and tests.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            shared: Arc::new(RpcShared {
                slot: Mutex::new(Some(result)),
                ready: Condvar::new(),
            }),
        }
    }

    /// An RPC whose reply will arrive later through the returned
    /// completion handle.
    pub fn pending() -> (Self, RpcCompletion<T>) {
        let shared = Arc::new(RpcShared {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            RpcCompletion { shared },
        )
    }

    /// Check whether the reply has arrived.
    pub fn is_ready(&self) -> bool {
        self.shared.slot.lock().is_some()
    }

    /// Block until the reply arrives and take it.
    pub fn wait(self) -> Result<T> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.ready.wait(&mut slot);
        }
        slot.take().unwrap()
    }
}

/// Fulfills a [`PendingRpc`] from another thread.
pub struct RpcCompletion<T> {
    shared: Arc<RpcShared<T>>,
}

impl<T> RpcCompletion<T> {
    /// Deliver the reply and wake any waiter.
    pub fn complete(self, result: Result<T>) {
        *self.shared.slot.lock() = Some(result);
        self.shared.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::thread;

    #[test]
    fn test_ready_rpc() {
        let rpc = PendingRpc::ready(Ok(42u32));
        assert!(rpc.is_ready());
        assert_eq!(rpc.wait().unwrap(), 42);
    }

    #[test]
    fn test_ready_rpc_failure() {
        let rpc: PendingRpc<()> = PendingRpc::ready(Err(Error::ServerNotUp(ServerId::new(1, 0))));
        assert!(rpc.wait().unwrap_err().is_server_gone());
    }

    #[test]
    fn test_pending_rpc_completed_from_thread() {
        let (rpc, completion) = PendingRpc::pending();
        assert!(!rpc.is_ready());

        let handle = thread::spawn(move || {
            completion.complete(Ok(7u32));
        });
        assert_eq!(rpc.wait().unwrap(), 7);
        handle.join().unwrap();
    }
}
