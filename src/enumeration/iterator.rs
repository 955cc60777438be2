//! The enumeration iterator a client round-trips between calls.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::KeyHash;
use crate::util::coding::{decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64};

/// One tablet-configuration snapshot on the iterator stack.
///
/// The topmost frame describes the serving master's current view;
/// older frames are retained so objects already emitted under previous
/// configurations (before a migration or hash-table resize) are not
/// emitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Smallest key hash of the tablet under this configuration.
    pub tablet_start_hash: KeyHash,
    /// Largest key hash of the tablet under this configuration.
    pub tablet_end_hash: KeyHash,
    /// Hash-table bucket count under this configuration.
    pub num_buckets: u64,
    /// Next bucket to scan; buckets before this are fully emitted.
    pub bucket_index: u64,
    /// Within `bucket_index`, key hashes below this are already
    /// emitted. Nonzero only after an oversized bucket forced a
    /// partial, hash-ordered emission.
    pub bucket_next_hash: KeyHash,
}

impl Frame {
    /// Create a frame with no scan progress.
    pub fn new(tablet_start_hash: KeyHash, tablet_end_hash: KeyHash, num_buckets: u64) -> Self {
        Self {
            tablet_start_hash,
            tablet_end_hash,
            num_buckets,
            bucket_index: 0,
            bucket_next_hash: 0,
        }
    }
}

/// Stack of [`Frame`]s tracking enumeration progress across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationIterator {
    frames: Vec<Frame>,
}

impl EnumerationIterator {
    /// Size of one serialized frame in bytes.
    const FRAME_WIRE_SIZE: usize = 5 * 8;

    /// Create an empty iterator, as a client does for its first call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames on the stack.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Push a new topmost frame.
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pop the topmost frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// The topmost frame.
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// The topmost frame, mutably.
    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// The frame at `index`, bottom of the stack first.
    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// Serialize for the trip back to the client: `u32 frame_count`
    /// then five little-endian `u64`s per frame, bottom first.
    pub fn serialize(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(4 + Self::FRAME_WIRE_SIZE * self.frames.len());
        encode_fixed32(&mut buf, self.frames.len() as u32);
        for frame in &self.frames {
            encode_fixed64(&mut buf, frame.tablet_start_hash);
            encode_fixed64(&mut buf, frame.tablet_end_hash);
            encode_fixed64(&mut buf, frame.num_buckets);
            encode_fixed64(&mut buf, frame.bucket_index);
            encode_fixed64(&mut buf, frame.bucket_next_hash);
        }
        buf.freeze()
    }

    /// Deserialize an iterator a client sent back.
    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        let count = decode_fixed32(&mut data)
            .ok_or_else(|| Error::bad_iterator("missing frame count"))?
            as usize;

        if data.len() < count * Self::FRAME_WIRE_SIZE {
            return Err(Error::bad_iterator(format!(
                "{} frames claimed but only {} bytes follow",
                count,
                data.len()
            )));
        }

        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(Frame {
                tablet_start_hash: decode_fixed64(&mut data).unwrap(),
                tablet_end_hash: decode_fixed64(&mut data).unwrap(),
                num_buckets: decode_fixed64(&mut data).unwrap(),
                bucket_index: decode_fixed64(&mut data).unwrap(),
                bucket_next_hash: decode_fixed64(&mut data).unwrap(),
            });
        }
        Ok(Self { frames })
    }
}
