//! Crash recovery of failed masters.
//!
//! When a master crashes, its log lives on as segment replicas
//! scattered across backups. A [`Recovery`] locates those replicas,
//! filters out stale ones, proves the log complete against its digest,
//! partitions the crashed master's tablets, and hands each partition to
//! a surviving master which replays the indicated replicas. The
//! [`MasterRecoveryManager`] owns the recoveries, drives them on a
//! single coordinator thread, and retries any that fail.

pub mod manager;
mod recovery;
mod tasks;
#[cfg(test)]
pub(crate) mod testing;
mod tracker;

pub use manager::MasterRecoveryManager;
pub use recovery::{Recovery, RecoveryContext, RecoveryStep};
pub use tracker::RecoveryTracker;

use crate::types::Tablet;

/// Status of a recovery. Strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryStatus {
    /// Gathering replica inventories and preparing backups.
    StartRecoveryOnBackups,
    /// Assigning partitions to recovery masters.
    StartRecoveryMasters,
    /// Waiting for recovery masters to report completion.
    WaitForRecoveryMasters,
    /// Telling backups the crashed master's state can be dropped.
    BroadcastRecoveryComplete,
    /// Nothing left to do.
    Done,
}

/// Policy for grouping a crashed master's tablets into recovery
/// partitions, each replayed by one recovery master.
pub trait PartitionStrategy: Send + Sync {
    /// Assign every tablet a partition id and return the number of
    /// partitions created.
    fn partition(&self, tablets: &mut [Tablet]) -> u32;
}

/// The naive default: every tablet is its own partition. A scheme that
/// groups tablets by expected replay time belongs here eventually.
#[derive(Debug, Default, Clone, Copy)]
pub struct OneTabletPerPartition;

impl PartitionStrategy for OneTabletPerPartition {
    fn partition(&self, tablets: &mut [Tablet]) -> u32 {
        for (index, tablet) in tablets.iter_mut().enumerate() {
            tablet.partition = Some(index as u32);
        }
        tablets.len() as u32
    }
}
