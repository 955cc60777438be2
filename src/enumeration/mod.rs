//! Resumable tablet enumeration.
//!
//! Clients read back every object in a tablet through a sequence of
//! enumeration calls. Between calls the master's tablet range may
//! shrink, the hash table may be resized, and objects may come and go;
//! the iterator a client round-trips between calls encodes enough of
//! the past configurations to emit every surviving object exactly once.
//!
//! The hash table and object log themselves live outside this module;
//! they are consumed through the two narrow traits below. A single
//! enumeration call requires the hash table to be stable; only
//! inter-call changes are tolerated.

mod iterator;
mod tablet_scan;

pub use iterator::{EnumerationIterator, Frame};
pub use tablet_scan::TabletEnumeration;

use bytes::Bytes;

use crate::types::{KeyHash, TableId};

/// Opaque reference to an object slot in the hash table.
pub type ObjectRef = u64;

/// The narrow view of one live object that enumeration needs.
#[derive(Debug, Clone)]
pub struct ObjectView {
    /// Table the object belongs to.
    pub table_id: TableId,
    /// Hash of the object's key.
    pub key_hash: KeyHash,
    /// The serialized object.
    pub data: Bytes,
}

/// The log holding the objects referenced by the hash table.
pub trait ObjectLog {
    /// Resolve a reference to a live object, or `None` if the
    /// reference does not name a live object (e.g. a tombstone).
    fn object(&self, reference: ObjectRef) -> Option<ObjectView>;
}

/// The hash table of objects living on this master.
pub trait ObjectMap {
    /// Current number of buckets. Always a power of two.
    fn num_buckets(&self) -> u64;

    /// Invoke `callback` for every reference stored in the bucket.
    fn for_each_in_bucket(&self, bucket_index: u64, callback: &mut dyn FnMut(ObjectRef));
}

/// The bucket a key hash lands in under a table with `num_buckets`
/// buckets. Shared by the scan and by iterator-frame coverage checks so
/// both agree on placement under any historical bucket count.
pub fn bucket_index(num_buckets: u64, key_hash: KeyHash) -> u64 {
    debug_assert!(num_buckets.is_power_of_two());
    key_hash & (num_buckets - 1)
}
