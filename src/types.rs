//! Core types for ramstore.

use std::fmt;

/// Identifier of a log segment within one master's log.
pub type SegmentId = u64;

/// Epoch of an open segment replica; bumped on re-replication.
pub type SegmentEpoch = u64;

/// 64-bit hash of an object key.
pub type KeyHash = u64;

/// Identifier of a table.
pub type TableId = u64;

/// Identifier of one recovery attempt.
pub type RecoveryId = u64;

/// Identifier of a server in the cluster.
///
/// Packs a slot index in the low 32 bits and a generation number in the
/// high 32 bits, so a slot reused after a crash yields a distinct id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl ServerId {
    /// The invalid server id. Never names a real server.
    pub const INVALID: ServerId = ServerId(u64::MAX);

    /// Create a server id from a slot index and generation.
    pub fn new(index: u32, generation: u32) -> Self {
        ServerId(((generation as u64) << 32) | index as u64)
    }

    /// Create a server id from its packed representation.
    pub fn from_raw(raw: u64) -> Self {
        ServerId(raw)
    }

    /// Get the packed representation.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Get the slot index.
    pub fn index(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// Get the generation number.
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Check whether this id names a real server.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}.{}", self.index(), self.generation())
        } else {
            write!(f, "invalid")
        }
    }
}

/// Set of services a server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceMask(u8);

impl ServiceMask {
    /// Serves objects and owns tablets.
    pub const MASTER: ServiceMask = ServiceMask(0x1);
    /// Stores segment replicas on behalf of masters.
    pub const BACKUP: ServiceMask = ServiceMask(0x2);

    /// The empty service set.
    pub fn empty() -> Self {
        ServiceMask(0)
    }

    /// Combine two masks.
    pub fn with(self, other: ServiceMask) -> Self {
        ServiceMask(self.0 | other.0)
    }

    /// Check whether every service in `other` is present.
    pub fn has(self, other: ServiceMask) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Status of a tablet in the coordinator's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletStatus {
    /// Assigned to a live master and serving requests.
    Normal,
    /// Owner crashed; reads and writes are refused until recovery completes.
    Recovering,
}

/// A hash-range slice of a table assigned to one master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablet {
    /// Table this tablet belongs to.
    pub table_id: TableId,
    /// Smallest key hash owned by this tablet.
    pub start_key_hash: KeyHash,
    /// Largest key hash owned by this tablet (inclusive).
    pub end_key_hash: KeyHash,
    /// Master currently responsible for the tablet.
    pub server_id: ServerId,
    /// Serving status.
    pub status: TabletStatus,
    /// Recovery partition this tablet was bucketed into, if any.
    pub partition: Option<u32>,
}

impl Tablet {
    /// Create a normal-status tablet with no partition assignment.
    pub fn new(
        table_id: TableId,
        start_key_hash: KeyHash,
        end_key_hash: KeyHash,
        server_id: ServerId,
    ) -> Self {
        Self {
            table_id,
            start_key_hash,
            end_key_hash,
            server_id,
            status: TabletStatus::Normal,
            partition: None,
        }
    }

    /// Check whether the given key hash falls inside this tablet.
    pub fn contains(&self, key_hash: KeyHash) -> bool {
        self.start_key_hash <= key_hash && key_hash <= self.end_key_hash
    }
}
