//! The append-only segment.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::options::DEFAULT_SEGMENT_SIZE;
use crate::util::crc::Crc32c;

use super::certificate::Certificate;
use super::entry::{EntryHeader, EntryType, ENTRY_TYPE_COUNT};
use super::seglet::Seglet;

/// Physical backing of a segment.
#[derive(Debug)]
enum Storage {
    /// Fixed-size fragments drawn from an allocator pool.
    Seglets(Vec<Seglet>),
    /// A single contiguous buffer wrapping a previously serialized
    /// segment. Immutable.
    Wrapped(Bytes),
}

/// An append-only log segment.
///
/// Entries are typed binary blobs addressed by the byte offset returned
/// at append time. The segment maintains a rolling checksum over entry
/// headers and length fields only; payloads are not checksummed here.
///
/// Appends are not internally synchronized. Concurrent appenders must
/// be serialized externally; readers of a closed segment may proceed in
/// parallel without locking.
#[derive(Debug)]
pub struct Segment {
    /// Size of each seglet. All seglets in one segment are identically
    /// sized powers of two.
    seglet_size: usize,
    storage: Storage,
    /// Once set, the segment is permanently immutable.
    closed: bool,
    /// Append offset: total bytes written so far.
    head: usize,
    /// Rolling checksum over every entry header and length field.
    checksum: Crc32c,
    /// Number of entries appended, per type.
    entry_counts: [u32; ENTRY_TYPE_COUNT],
    /// Bytes consumed by entries of each type, including framing.
    entry_lengths: [u32; ENTRY_TYPE_COUNT],
}

impl Segment {
    /// Construct a segment over a single heap block of the default
    /// size. Useful for temporary segments that move data between
    /// servers.
    pub fn new() -> Self {
        Self::with_seglets(vec![Seglet::standalone(DEFAULT_SEGMENT_SIZE)])
    }

    /// Construct a segment over the provided seglets. All seglets must
    /// share one power-of-two size.
    pub fn with_seglets(seglets: Vec<Seglet>) -> Self {
        assert!(!seglets.is_empty());
        let seglet_size = seglets[0].len();
        assert!(seglet_size.is_power_of_two());
        assert!(seglets.iter().all(|s| s.len() == seglet_size));
        Self {
            seglet_size,
            storage: Storage::Seglets(seglets),
            closed: false,
            head: 0,
            checksum: Crc32c::new(),
            entry_counts: [0; ENTRY_TYPE_COUNT],
            entry_lengths: [0; ENTRY_TYPE_COUNT],
        }
    }

    /// Construct an immutable segment wrapping a previously serialized
    /// segment, e.g. a replica received from a backup. It may be read
    /// and verified but never appended to.
    pub fn wrapping(buffer: Bytes) -> Self {
        let length = buffer.len();
        Self {
            seglet_size: length.max(1),
            storage: Storage::Wrapped(buffer),
            closed: true,
            head: length,
            checksum: Crc32c::new(),
            entry_counts: [0; ENTRY_TYPE_COUNT],
            entry_lengths: [0; ENTRY_TYPE_COUNT],
        }
    }

    /// Total bytes of storage allocated to this segment.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Seglets(seglets) => seglets.len() * self.seglet_size,
            Storage::Wrapped(buffer) => buffer.len(),
        }
    }

    /// Number of seglet-sized blocks backing this segment.
    pub fn seglets_allocated(&self) -> usize {
        match &self.storage {
            Storage::Seglets(seglets) => seglets.len(),
            Storage::Wrapped(_) => 1,
        }
    }

    /// Number of seglets touched by appends so far. Only whole seglets
    /// past the head are considered unused.
    pub fn seglets_in_use(&self) -> usize {
        (self.head + self.seglet_size - 1) / self.seglet_size
    }

    /// Check whether the segment has room for all of the listed
    /// entries, each with its header and length-field overhead. Closed
    /// segments have room for nothing.
    pub fn has_space_for(&self, entry_lengths: &[u32]) -> bool {
        let needed: usize = entry_lengths
            .iter()
            .map(|&len| EntryHeader::framed_size(len))
            .sum();
        let bytes_left = if self.closed {
            0
        } else {
            self.capacity() - self.head
        };
        needed <= bytes_left
    }

    /// Append a typed entry.
    ///
    /// On success returns the segment offset of the new entry, usable
    /// with [`Segment::get_entry`]. Returns `None` without writing
    /// anything if there is insufficient space or the segment is
    /// closed.
    pub fn append(&mut self, entry_type: EntryType, data: &[u8]) -> Option<u32> {
        let length = data.len() as u32;
        if !self.has_space_for(&[length]) {
            return None;
        }

        let header = EntryHeader::new(entry_type, length);
        let start = self.head;

        let header_byte = [header.to_byte()];
        self.copy_in(self.head, &header_byte);
        self.checksum.update(&header_byte);
        self.head += 1;

        let length_field = &length.to_le_bytes()[..header.length_bytes()];
        self.copy_in(self.head, length_field);
        self.checksum.update(length_field);
        self.head += length_field.len();

        self.copy_in(self.head, data);
        self.head += data.len();

        let type_index = entry_type.to_byte() as usize;
        self.entry_counts[type_index] += 1;
        self.entry_lengths[type_index] += EntryHeader::framed_size(length) as u32;

        Some(start as u32)
    }

    /// Close the segment, making it permanently immutable. Idempotent.
    ///
    /// This is soft state only: neither the contents nor the
    /// certificate record closure. Backups track closure separately.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Check whether the segment has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total bytes appended so far.
    pub fn appended_length(&self) -> u32 {
        self.head as u32
    }

    /// Emit a certificate covering everything appended so far.
    ///
    /// The certificate is built from a copy of the rolling checksum, so
    /// it stays valid for this snapshot even as more entries are
    /// appended later.
    pub fn certificate(&self) -> Certificate {
        let mut certificate = Certificate {
            segment_length: self.head as u32,
            checksum: 0,
        };
        let mut sum = self.checksum;
        sum.update(&certificate.prefix_bytes());
        certificate.checksum = sum.result();
        certificate
    }

    /// Get an entry appended earlier.
    ///
    /// `offset` must be a value returned by a prior [`Segment::append`]
    /// on this segment (or on the segment a wrapped replica was built
    /// from, after its certificate verified). Behaviour for any other
    /// offset is undefined; out-of-range offsets panic.
    pub fn get_entry(&self, offset: u32) -> (EntryType, Bytes) {
        let offset = offset as usize;
        let header = self.entry_header(offset);
        let length_bytes = header.length_bytes();

        let mut length_buf = [0u8; 4];
        self.copy_out(offset + 1, &mut length_buf[..length_bytes]);
        let length = u32::from_le_bytes(length_buf);

        let mut data = BytesMut::with_capacity(length as usize);
        self.append_to_buffer(&mut data, (offset + 1 + length_bytes) as u32, length);

        let entry_type = header.entry_type().unwrap_or(EntryType::Invalid);
        (entry_type, data.freeze())
    }

    /// Number of entries of the given type ever appended. There is no
    /// notion of dead or live entries here.
    pub fn entry_count(&self, entry_type: EntryType) -> u32 {
        self.entry_counts[entry_type.to_byte() as usize]
    }

    /// Bytes consumed by entries of the given type, including framing.
    pub fn entry_lengths(&self, entry_type: EntryType) -> u32 {
        self.entry_lengths[entry_type.to_byte() as usize]
    }

    /// Copy `length` bytes starting at `offset` into `out`, gathering
    /// across seglet boundaries.
    ///
    /// # Panics
    ///
    /// Panics if `offset + length` exceeds the appended length.
    pub fn append_to_buffer(&self, out: &mut BytesMut, offset: u32, length: u32) {
        let mut offset = offset as usize;
        let mut remaining = length as usize;
        assert!(
            offset + remaining <= self.head,
            "invalid length ({}) and/or offset ({}) for segment of length {}",
            length,
            offset,
            self.head,
        );

        while remaining > 0 {
            let chunk = self.peek(offset);
            let n = remaining.min(chunk.len());
            out.put_slice(&chunk[..n]);
            offset += n;
            remaining -= n;
        }
    }

    /// Free `count` unused seglets from the end of a closed segment,
    /// returning their blocks to the pool.
    ///
    /// Returns false without doing anything if the segment is not
    /// closed, is not seglet-backed, or `count` exceeds the number of
    /// seglets never touched by an append.
    pub fn free_unused_seglets(&mut self, count: usize) -> bool {
        let in_use = self.seglets_in_use();
        let seglets = match &mut self.storage {
            Storage::Seglets(seglets) if self.closed => seglets,
            _ => return false,
        };

        let unused = seglets.len() - in_use;
        if count > unused {
            return false;
        }
        seglets.truncate(seglets.len() - count);
        true
    }

    /// Check the integrity of the segment's metadata by walking every
    /// entry and verifying that all lengths stay in bounds and that the
    /// recomputed checksum matches the certificate.
    ///
    /// A passing check means the segment can be iterated trivially and,
    /// with high probability, yields exactly the entries the writer
    /// framed. Payload contents are not covered.
    pub fn check_metadata_integrity(&self, certificate: &Certificate) -> bool {
        let expected_length = certificate.segment_length as usize;
        let capacity = self.capacity();
        let mut sum = Crc32c::new();
        let mut offset = 0usize;

        while offset < expected_length && !self.peek(offset).is_empty() {
            let header = self.entry_header(offset);
            sum.update(&[header.to_byte()]);

            let length_bytes = header.length_bytes();
            let mut length_buf = [0u8; 4];
            self.copy_out(offset + 1, &mut length_buf[..length_bytes]);
            sum.update(&length_buf[..length_bytes]);
            let length = u32::from_le_bytes(length_buf) as usize;

            offset += 1 + length_bytes + length;
            if offset > capacity {
                warn!(
                    "segment corrupt: entries run off past allocated segment \
                     size (segment size {}, next entry would have started at {})",
                    capacity, offset
                );
                return false;
            }
        }

        if offset > expected_length {
            warn!(
                "segment corrupt: entries run off past expected length \
                 (expected {}, next entry would have started at {})",
                expected_length, offset
            );
            return false;
        }

        sum.update(&certificate.prefix_bytes());
        if certificate.checksum != sum.result() {
            warn!(
                "segment corrupt: bad checksum (expected {:#010x}, was {:#010x})",
                certificate.checksum,
                sum.result()
            );
            return false;
        }

        true
    }

    /// The contiguous bytes starting at `offset` and running to the end
    /// of the seglet containing it. Empty past the allocated capacity.
    fn peek(&self, offset: usize) -> &[u8] {
        match &self.storage {
            Storage::Seglets(seglets) => {
                let index = offset / self.seglet_size;
                if index >= seglets.len() {
                    return &[];
                }
                &seglets[index].as_slice()[offset % self.seglet_size..]
            }
            Storage::Wrapped(buffer) => {
                if offset >= buffer.len() {
                    return &[];
                }
                &buffer[offset..]
            }
        }
    }

    /// Read the entry header stored at `offset`. Headers are one byte,
    /// so they are never split across seglets.
    fn entry_header(&self, offset: usize) -> EntryHeader {
        EntryHeader::from_byte(self.peek(offset)[0])
    }

    /// Scatter a contiguous buffer into the segment at `offset`.
    /// Returns the number of bytes written; stops short at the end of
    /// the allocated capacity.
    fn copy_in(&mut self, mut offset: usize, data: &[u8]) -> usize {
        let seglet_size = self.seglet_size;
        let seglets = match &mut self.storage {
            Storage::Seglets(seglets) => seglets,
            Storage::Wrapped(_) => return 0,
        };

        let mut written = 0;
        while written < data.len() {
            let index = offset / seglet_size;
            if index >= seglets.len() {
                break;
            }
            let within = offset % seglet_size;
            let chunk = &mut seglets[index].as_mut_slice()[within..];
            let n = chunk.len().min(data.len() - written);
            chunk[..n].copy_from_slice(&data[written..written + n]);
            written += n;
            offset += n;
        }
        written
    }

    /// Gather bytes from the segment at `offset` into a contiguous
    /// buffer. Returns the number of bytes read; stops short at the end
    /// of the allocated capacity.
    fn copy_out(&self, mut offset: usize, out: &mut [u8]) -> usize {
        let mut read = 0;
        while read < out.len() {
            let chunk = self.peek(offset);
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len().min(out.len() - read);
            out[read..read + n].copy_from_slice(&chunk[..n]);
            read += n;
            offset += n;
        }
        read
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}
