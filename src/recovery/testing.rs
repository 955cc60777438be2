//! Mock cluster used by recovery unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cluster::{ServerDetails, ServerList, ServerTracker};
use crate::error::Error;
use crate::rpc::{
    BackupClient, DigestInfo, MasterClient, PendingRpc, ReplicaInfo, ReplicaMapEntry,
    StartReadingDataResult, TableManager,
};
use crate::segment::LogDigest;
use crate::types::{RecoveryId, ServerId, ServiceMask, Tablet, TabletStatus};

use super::recovery::RecoveryContext;
use super::tracker::RecoveryTracker;
use super::OneTabletPerPartition;

/// Backup client answering from canned per-backup replies. Backups
/// without a canned reply behave as if they were down.
#[derive(Default)]
pub(crate) struct MockBackupClient {
    pub responses: Mutex<HashMap<ServerId, StartReadingDataResult>>,
    pub partition_calls: Mutex<Vec<ServerId>>,
    pub complete_calls: Mutex<Vec<ServerId>>,
}

impl BackupClient for MockBackupClient {
    fn start_reading_data(
        &self,
        backup_id: ServerId,
        _recovery_id: RecoveryId,
        _crashed_server_id: ServerId,
    ) -> PendingRpc<StartReadingDataResult> {
        let result = self
            .responses
            .lock()
            .get(&backup_id)
            .cloned()
            .map(Ok)
            .unwrap_or(Err(Error::ServerNotUp(backup_id)));
        PendingRpc::ready(result)
    }

    fn start_partitioning(
        &self,
        backup_id: ServerId,
        _recovery_id: RecoveryId,
        _crashed_server_id: ServerId,
        _tablets: &[Tablet],
    ) -> PendingRpc<()> {
        self.partition_calls.lock().push(backup_id);
        PendingRpc::ready(Ok(()))
    }

    fn recovery_complete(
        &self,
        backup_id: ServerId,
        _crashed_server_id: ServerId,
    ) -> PendingRpc<()> {
        self.complete_calls.lock().push(backup_id);
        PendingRpc::ready(Ok(()))
    }
}

/// One recorded `recover` RPC.
pub(crate) struct RecoverCall {
    pub master_id: ServerId,
    pub recovery_id: RecoveryId,
    pub partition_id: u32,
    pub tablets: Vec<Tablet>,
    pub replica_map: Vec<ReplicaMapEntry>,
}

/// Master client recording `recover` calls; designated masters are
/// unreachable.
#[derive(Default)]
pub(crate) struct MockMasterClient {
    pub calls: Mutex<Vec<RecoverCall>>,
    pub unreachable: Mutex<Vec<ServerId>>,
}

impl MasterClient for MockMasterClient {
    fn recover(
        &self,
        master_id: ServerId,
        recovery_id: RecoveryId,
        _crashed_server_id: ServerId,
        partition_id: u32,
        tablets: &[Tablet],
        replica_map: &[ReplicaMapEntry],
    ) -> PendingRpc<()> {
        if self.unreachable.lock().contains(&master_id) {
            return PendingRpc::ready(Err(Error::ServerNotUp(master_id)));
        }
        self.calls.lock().push(RecoverCall {
            master_id,
            recovery_id,
            partition_id,
            tablets: tablets.to_vec(),
            replica_map: replica_map.to_vec(),
        });
        PendingRpc::ready(Ok(()))
    }
}

/// Table manager serving a fixed tablet list.
#[derive(Default)]
pub(crate) struct MockTableManager {
    pub tablets: Mutex<Vec<Tablet>>,
}

impl TableManager for MockTableManager {
    fn mark_recovering(&self, _crashed_server_id: ServerId) -> Vec<Tablet> {
        let mut tablets = self.tablets.lock().clone();
        for tablet in &mut tablets {
            tablet.status = TabletStatus::Recovering;
        }
        tablets
    }
}

/// A mock cluster: server list, trackers, and canned RPC endpoints.
pub(crate) struct TestCluster {
    pub backups: Arc<MockBackupClient>,
    pub masters: Arc<MockMasterClient>,
    pub table_manager: Arc<MockTableManager>,
    pub tracker: Arc<RecoveryTracker>,
    pub server_list: ServerList,
    pub membership: Arc<ServerTracker>,
}

impl TestCluster {
    pub fn new() -> Self {
        let membership = ServerTracker::new();
        let server_list = ServerList::new();
        server_list.register_tracker(&membership);
        Self {
            backups: Arc::new(MockBackupClient::default()),
            masters: Arc::new(MockMasterClient::default()),
            table_manager: Arc::new(MockTableManager::default()),
            tracker: RecoveryTracker::new(Arc::clone(&membership)),
            server_list,
            membership,
        }
    }

    /// Add a server and drain the membership tracker so queries see it.
    pub fn add_server(&self, index: u32, services: ServiceMask) -> ServerId {
        let server_id = ServerId::new(index, 0);
        self.server_list.add(ServerDetails {
            server_id,
            services,
            expected_read_mbs: 100,
        });
        while self.membership.poll_change().is_some() {}
        server_id
    }

    pub fn add_tablet(&self, table_id: u64, start: u64, end: u64, owner: ServerId) {
        self.table_manager
            .tablets
            .lock()
            .push(Tablet::new(table_id, start, end, owner));
    }

    pub fn backup_reply(&self, backup_id: ServerId, result: StartReadingDataResult) {
        self.backups.responses.lock().insert(backup_id, result);
    }

    pub fn context(&self) -> RecoveryContext {
        RecoveryContext {
            backups: Arc::clone(&self.backups) as Arc<dyn BackupClient>,
            masters: Arc::clone(&self.masters) as Arc<dyn MasterClient>,
            table_manager: Arc::clone(&self.table_manager) as Arc<dyn TableManager>,
            tracker: Arc::clone(&self.tracker),
            partition_strategy: Arc::new(OneTabletPerPartition),
            max_concurrent_rpcs: 10,
        }
    }
}

/// A closed replica of `segment_id` at epoch zero.
pub(crate) fn closed_replica(segment_id: u64) -> ReplicaInfo {
    ReplicaInfo {
        segment_id,
        segment_epoch: 0,
        closed: true,
    }
}

/// A digest found on `segment_id` listing `ids`.
pub(crate) fn digest_on(segment_id: u64, ids: &[u64]) -> Option<DigestInfo> {
    Some(DigestInfo {
        segment_id,
        segment_epoch: 0,
        digest: LogDigest::new(ids.to_vec()),
    })
}
