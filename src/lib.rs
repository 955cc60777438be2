//! # ramstore
//!
//! The core of a distributed in-memory storage cluster: the
//! log-structured segment store that makes masters durable, and the
//! crash-recovery machinery that rebuilds a failed master from segment
//! replicas scattered across its backups.
//!
//! ## Pieces
//!
//! - **Segments**: typed, checksummed append-only log units split over
//!   fixed-size seglets, with certificates that authenticate a
//!   replica's framing end to end
//! - **Recovery**: the coordinator-side protocol that inventories
//!   replicas, proves the crashed log complete against its digest,
//!   partitions tablets, and fans replay out across recovery masters
//! - **Backup failure monitor**: a master-side worker that turns
//!   membership changes into re-replication and log-head rollover
//! - **Enumeration**: the resumable hash-table-order scan clients use
//!   to read back every object in a tablet
//!
//! Transports, the hash table, and the object format stay outside;
//! this crate consumes them through narrow traits.

// Public modules
pub mod error;
pub mod options;
pub mod types;

// Storage substrate
pub mod segment;

// Cluster surface
pub mod cluster;
pub mod rpc;

// Coordinator and master-side machinery
pub mod enumeration;
pub mod monitor;
pub mod parallel;
pub mod recovery;

// Internal support modules
mod metrics;
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::Config;
pub use types::{SegmentId, ServerId, ServiceMask, Tablet, TabletStatus};

// Segment store
pub use segment::{Certificate, EntryType, LogDigest, Segment, SegmentIterator, SegletAllocator};

// Recovery
pub use recovery::{MasterRecoveryManager, Recovery, RecoveryStep};

// Monitoring
pub use monitor::BackupFailureMonitor;

// Enumeration
pub use enumeration::{EnumerationIterator, TabletEnumeration};

// Metrics
pub use metrics::{Counter, Gauge, RecoveryMetrics};
