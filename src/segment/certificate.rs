//! Segment metadata certificates.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::coding::{decode_fixed32, encode_fixed32};

/// Authenticator for a segment's metadata stream.
///
/// A valid certificate proves that iterating the segment up to
/// `segment_length` yields exactly the framing the writer emitted.
/// Payload bytes are not covered; entries carry their own checksums if
/// payload integrity matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Certificate {
    /// Number of bytes of the segment the certificate covers.
    pub segment_length: u32,
    /// CRC32C of the header+length stream followed by the certificate's
    /// own leading bytes.
    pub checksum: u32,
}

impl Certificate {
    /// Serialized size in bytes.
    pub const WIRE_SIZE: usize = 8;

    /// The leading bytes of the certificate that are folded into the
    /// checksum (everything before the checksum field).
    pub fn prefix_bytes(&self) -> [u8; 4] {
        self.segment_length.to_le_bytes()
    }

    /// Serialize to the fixed little-endian wire layout.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        encode_fixed32(&mut buf, self.segment_length);
        encode_fixed32(&mut buf, self.checksum);
        buf.freeze()
    }

    /// Deserialize from the wire layout.
    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::WIRE_SIZE {
            return Err(Error::Truncated {
                needed: Self::WIRE_SIZE,
                available: data.len(),
            });
        }
        let segment_length = decode_fixed32(&mut data).unwrap();
        let checksum = decode_fixed32(&mut data).unwrap();
        Ok(Self {
            segment_length,
            checksum,
        })
    }
}
