//! Log-structured segment store.
//!
//! A segment is the append-only replication granule of a master's log.
//! Entries are framed records; the segment keeps a rolling CRC32C over
//! every entry header and length field (never payload bytes) and can
//! emit a certificate that lets a reader prove the framing of a replica
//! is exactly what the writer produced.
//!
//! # Format
//!
//! Each entry is:
//! - 1-byte header: low 6 bits entry type, high 2 bits `length_bytes - 1`
//! - `length_bytes` little-endian bytes of payload length (1-4)
//! - payload
//!
//! The certificate is `{u32 segment_length, u32 checksum}`, where the
//! checksum is the CRC32C of the header+length stream followed by the
//! certificate's own leading bytes (everything before the checksum field).
//!
//! Physical storage is a vector of identically sized power-of-two
//! seglets drawn from an allocator pool, or a single wrapped contiguous
//! buffer for segments received from the network (immutable).

mod certificate;
mod digest;
mod entry;
mod iterator;
mod seglet;
mod segment;

pub use certificate::Certificate;
pub use digest::LogDigest;
pub use entry::{EntryHeader, EntryType, ENTRY_TYPE_COUNT};
pub use iterator::{SegmentEntry, SegmentIterator};
pub use seglet::{Seglet, SegletAllocator};
pub use segment::Segment;
