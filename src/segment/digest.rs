//! Log digests.
//!
//! A master publishes a digest at the start of each segment listing
//! every segment believed necessary to reconstruct its log. During
//! recovery the digest from the head segment is the completeness oracle:
//! a log is recoverable only if every listed segment has a surviving
//! replica somewhere.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::SegmentId;
use crate::util::coding::{decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64};

/// The list of segment ids required to reconstruct a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDigest {
    segment_ids: Vec<SegmentId>,
}

impl LogDigest {
    /// Build a digest over the given segment ids.
    pub fn new(segment_ids: Vec<SegmentId>) -> Self {
        Self { segment_ids }
    }

    /// The listed segment ids, in publication order.
    pub fn segment_ids(&self) -> &[SegmentId] {
        &self.segment_ids
    }

    /// Number of segments listed.
    pub fn len(&self) -> usize {
        self.segment_ids.len()
    }

    /// Check whether the digest lists no segments.
    pub fn is_empty(&self) -> bool {
        self.segment_ids.is_empty()
    }

    /// Serialize to the wire layout: `u32 count` then `count`
    /// little-endian `u64` segment ids.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 8 * self.segment_ids.len());
        encode_fixed32(&mut buf, self.segment_ids.len() as u32);
        for &id in &self.segment_ids {
            encode_fixed64(&mut buf, id);
        }
        buf.freeze()
    }

    /// Deserialize from the wire layout.
    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        let available = data.len();
        let count = decode_fixed32(&mut data).ok_or(Error::Truncated {
            needed: 4,
            available,
        })? as usize;

        let needed = 4 + 8 * count;
        if available < needed {
            return Err(Error::Truncated { needed, available });
        }

        let mut segment_ids = Vec::with_capacity(count);
        for _ in 0..count {
            segment_ids.push(decode_fixed64(&mut data).unwrap());
        }
        Ok(Self { segment_ids })
    }
}
