//! Integration tests for the segment store.

use bytes::BytesMut;
use ramstore::segment::{EntryType, LogDigest, Segment, SegmentIterator, SegletAllocator};
use ramstore::Config;

/// Append a mixed workload and read every entry back by offset.
#[test]
fn segment_round_trip_across_seglets() {
    let allocator = SegletAllocator::new(1024, 16);
    let mut segment = Segment::with_seglets(allocator.alloc(8).unwrap());

    let mut appended = Vec::new();
    for i in 0..60u32 {
        let ty = if i % 3 == 0 {
            EntryType::Tombstone
        } else {
            EntryType::Object
        };
        let payload: Vec<u8> = (0..(i * 11 % 300) as u8).map(|b| b.wrapping_mul(7)).collect();
        let offset = segment.append(ty, &payload).unwrap();
        appended.push((offset, ty, payload));
    }

    for (offset, ty, payload) in &appended {
        let (got_ty, got_payload) = segment.get_entry(*offset);
        assert_eq!(got_ty, *ty);
        assert_eq!(&got_payload[..], &payload[..]);
    }
}

/// A certificate validates a byte-identical replica and survives the
/// replica round trip through a wrapped buffer.
#[test]
fn certificate_validates_replica_copy() {
    let allocator = SegletAllocator::new(2048, 8);
    let mut segment = Segment::with_seglets(allocator.alloc(4).unwrap());
    for i in 0..40u32 {
        segment
            .append(EntryType::Object, &vec![i as u8; 50 + (i % 17) as usize])
            .unwrap();
    }
    segment.close();
    let certificate = segment.certificate();

    let mut wire = BytesMut::new();
    segment.append_to_buffer(&mut wire, 0, segment.appended_length());
    let replica = Segment::wrapping(wire.freeze());

    assert!(replica.check_metadata_integrity(&certificate));

    let original: Vec<_> = SegmentIterator::new(&segment)
        .map(|entry| (entry.entry_type, entry.data))
        .collect();
    let replayed: Vec<_> = SegmentIterator::checked(&replica, &certificate)
        .unwrap()
        .map(|entry| (entry.entry_type, entry.data))
        .collect();
    assert_eq!(original, replayed);
}

/// Byte positions inside the wire image that the certificate covers:
/// every entry header byte and every length byte.
fn metadata_positions(wire: &[u8], length: usize) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut offset = 0;
    while offset < length {
        positions.push(offset); // header
        let header = wire[offset];
        let length_bytes = ((header >> 6) + 1) as usize;
        let mut entry_len = 0u32;
        for i in 0..length_bytes {
            positions.push(offset + 1 + i);
            entry_len |= (wire[offset + 1 + i] as u32) << (8 * i);
        }
        offset += 1 + length_bytes + entry_len as usize;
    }
    positions
}

/// Flipping any covered metadata bit, or any bit of the certificate
/// itself, makes the integrity check fail.
#[test]
fn certificate_detects_every_metadata_bit_flip() {
    let allocator = SegletAllocator::new(4096, 2);
    let mut segment = Segment::with_seglets(allocator.alloc(1).unwrap());
    segment.append(EntryType::Object, b"some object data").unwrap();
    segment.append(EntryType::Tombstone, &[0xaa; 300]).unwrap();
    segment.append(EntryType::LogDigest, b"digestish").unwrap();
    let certificate = segment.certificate();

    let mut wire = BytesMut::new();
    segment.append_to_buffer(&mut wire, 0, segment.appended_length());
    let wire = wire.freeze();

    for position in metadata_positions(&wire, wire.len()) {
        for bit in 0..8 {
            let mut corrupt = wire.to_vec();
            corrupt[position] ^= 1 << bit;
            let replica = Segment::wrapping(corrupt.into());
            assert!(
                !replica.check_metadata_integrity(&certificate),
                "flip of bit {} at byte {} went undetected",
                bit,
                position
            );
        }
    }

    // Certificate corruption must be caught too.
    let replica = Segment::wrapping(wire.clone());
    for bit in 0..32 {
        let mut bad = certificate;
        bad.segment_length ^= 1 << bit;
        assert!(!replica.check_metadata_integrity(&bad));

        let mut bad = certificate;
        bad.checksum ^= 1 << bit;
        assert!(!replica.check_metadata_integrity(&bad));
    }
}

/// Payload bytes are deliberately not covered by the certificate.
#[test]
fn certificate_ignores_payload_bytes() {
    let allocator = SegletAllocator::new(4096, 2);
    let mut segment = Segment::with_seglets(allocator.alloc(1).unwrap());
    segment.append(EntryType::Object, b"payload under no protection").unwrap();
    let certificate = segment.certificate();

    let mut wire = BytesMut::new();
    segment.append_to_buffer(&mut wire, 0, segment.appended_length());
    let mut corrupt = wire.to_vec();
    // Header is 1 byte, length field 1 byte; byte 2 is payload.
    corrupt[2] ^= 0xff;

    let replica = Segment::wrapping(corrupt.into());
    assert!(replica.check_metadata_integrity(&certificate));
}

/// Fill a one-seglet segment until append fails; the certificate over
/// the final state still verifies.
#[test]
fn append_until_overflow_keeps_metadata_consistent() {
    let allocator = SegletAllocator::new(4096, 1);
    let mut segment = Segment::with_seglets(allocator.alloc(1).unwrap());

    let mut appends = 0;
    while segment.append(EntryType::Object, &[7u8; 64]).is_some() {
        appends += 1;
    }
    assert!(appends > 0);
    assert!(segment.appended_length() <= 4096);

    let certificate = segment.certificate();
    assert_eq!(certificate.segment_length, segment.appended_length());
    assert!(segment.check_metadata_integrity(&certificate));
    assert_eq!(segment.entry_count(EntryType::Object), appends);
}

/// A log digest written into a segment survives replication and decode.
#[test]
fn log_digest_round_trips_through_segment() {
    let digest = LogDigest::new(vec![10, 11, 12, 13]);

    let allocator = SegletAllocator::new(4096, 2);
    let mut segment = Segment::with_seglets(allocator.alloc(1).unwrap());
    let offset = segment
        .append(EntryType::LogDigest, &digest.serialize())
        .unwrap();
    let certificate = segment.certificate();

    let mut wire = BytesMut::new();
    segment.append_to_buffer(&mut wire, 0, segment.appended_length());
    let replica = Segment::wrapping(wire.freeze());
    assert!(replica.check_metadata_integrity(&certificate));

    let (ty, data) = replica.get_entry(offset);
    assert_eq!(ty, EntryType::LogDigest);
    assert_eq!(LogDigest::deserialize(&data).unwrap(), digest);
}

/// A pool sized from the configuration carves out full segments.
#[test]
fn pool_from_config_geometry() {
    let config = Config::for_testing();
    let allocator = SegletAllocator::new(config.seglet_size, config.pool_seglets);

    let mut segment =
        Segment::with_seglets(allocator.alloc(config.seglets_per_segment).unwrap());
    assert_eq!(segment.capacity(), config.segment_size());

    segment.append(EntryType::SegmentHeader, b"log 1, segment 0").unwrap();
    let certificate = segment.certificate();
    assert!(segment.check_metadata_integrity(&certificate));
}

/// Freeing unused seglets returns blocks to the pool for reuse.
#[test]
fn seglet_pool_reclaims_closed_segments() {
    let allocator = SegletAllocator::new(1024, 8);

    let mut segment = Segment::with_seglets(allocator.alloc(6).unwrap());
    assert_eq!(allocator.free_count(), 2);
    segment.append(EntryType::Object, &[1u8; 100]).unwrap();
    segment.close();

    assert!(segment.free_unused_seglets(5));
    assert_eq!(allocator.free_count(), 7);

    drop(segment);
    assert_eq!(allocator.free_count(), 8);
}
