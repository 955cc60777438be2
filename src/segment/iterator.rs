//! Reconstructive iteration over a segment's entries.

use bytes::Bytes;

use crate::error::{Error, Result};

use super::certificate::Certificate;
use super::entry::EntryType;
use super::segment::Segment;

/// One entry yielded during iteration.
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    /// Type of the entry.
    pub entry_type: EntryType,
    /// Segment offset of the entry, as returned by the original append.
    pub offset: u32,
    /// The entry payload.
    pub data: Bytes,
}

/// In-order walk over every entry of a segment.
///
/// For replicas received from the network, use
/// [`SegmentIterator::checked`] so iteration only proceeds once the
/// certificate proves the framing intact. For segments built locally,
/// [`SegmentIterator::new`] walks everything up to the current head.
pub struct SegmentIterator<'a> {
    segment: &'a Segment,
    offset: usize,
    limit: usize,
}

impl<'a> SegmentIterator<'a> {
    /// Iterate a locally built segment up to its head.
    pub fn new(segment: &'a Segment) -> Self {
        Self {
            segment,
            offset: 0,
            limit: segment.appended_length() as usize,
        }
    }

    /// Iterate a replica after verifying its metadata against the
    /// given certificate.
    pub fn checked(segment: &'a Segment, certificate: &Certificate) -> Result<Self> {
        if !segment.check_metadata_integrity(certificate) {
            return Err(Error::corruption(
                "replica failed metadata integrity check",
            ));
        }
        Ok(Self {
            segment,
            offset: 0,
            limit: certificate.segment_length as usize,
        })
    }
}

impl<'a> Iterator for SegmentIterator<'a> {
    type Item = SegmentEntry;

    fn next(&mut self) -> Option<SegmentEntry> {
        if self.offset >= self.limit {
            return None;
        }
        let offset = self.offset as u32;
        let (entry_type, data) = self.segment.get_entry(offset);
        self.offset += super::entry::EntryHeader::framed_size(data.len() as u32);
        Some(SegmentEntry {
            entry_type,
            offset,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegletAllocator;
    use bytes::BytesMut;

    fn build_segment() -> Segment {
        let allocator = SegletAllocator::new(4096, 4);
        let mut segment = Segment::with_seglets(allocator.alloc(1).unwrap());
        segment.append(EntryType::SegmentHeader, b"hdr").unwrap();
        segment.append(EntryType::Object, b"first").unwrap();
        segment.append(EntryType::Tombstone, b"second").unwrap();
        segment
    }

    #[test]
    fn test_iterates_in_append_order() {
        let segment = build_segment();
        let entries: Vec<_> = SegmentIterator::new(&segment).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_type, EntryType::SegmentHeader);
        assert_eq!(&entries[1].data[..], b"first");
        assert_eq!(entries[2].entry_type, EntryType::Tombstone);
    }

    #[test]
    fn test_offsets_match_get_entry() {
        let segment = build_segment();
        for entry in SegmentIterator::new(&segment) {
            let (ty, data) = segment.get_entry(entry.offset);
            assert_eq!(ty, entry.entry_type);
            assert_eq!(data, entry.data);
        }
    }

    #[test]
    fn test_checked_iteration_over_replica() {
        let segment = build_segment();
        let certificate = segment.certificate();

        let mut wire = BytesMut::new();
        segment.append_to_buffer(&mut wire, 0, segment.appended_length());
        let replica = Segment::wrapping(wire.freeze());

        let entries: Vec<_> = SegmentIterator::checked(&replica, &certificate)
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(&entries[1].data[..], b"first");
    }

    #[test]
    fn test_checked_rejects_corrupt_replica() {
        let segment = build_segment();
        let certificate = segment.certificate();

        let mut wire = BytesMut::new();
        segment.append_to_buffer(&mut wire, 0, segment.appended_length());
        wire[0] ^= 0x40; // corrupt the first header's length-bytes field
        let replica = Segment::wrapping(wire.freeze());

        assert!(SegmentIterator::checked(&replica, &certificate).is_err());
    }
}
