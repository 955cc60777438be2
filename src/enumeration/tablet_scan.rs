//! The resumable tablet scan.

use bytes::{BufMut, BytesMut};

use crate::types::KeyHash;

use super::iterator::{EnumerationIterator, Frame};
use super::{bucket_index, ObjectLog, ObjectMap, ObjectView};

/// One enumeration call over a tablet.
///
/// Walks the hash table in bucket order from the iterator's recorded
/// position, appending objects to the payload as `u32 length || bytes`
/// records until the payload limit is reached. The iterator is updated
/// with the position the next call should resume from.
pub struct TabletEnumeration<'a> {
    /// Table being enumerated.
    table_id: u64,
    /// Smallest key hash the client asked for. May be below the range
    /// this master actually owns after a tablet split.
    requested_start_hash: KeyHash,
    /// Smallest key hash of the tablet living on this master.
    actual_start_hash: KeyHash,
    /// Largest key hash of the tablet living on this master.
    actual_end_hash: KeyHash,
    /// Payload size limit in bytes.
    max_payload_bytes: u32,
    log: &'a dyn ObjectLog,
    object_map: &'a dyn ObjectMap,
}

impl<'a> TabletEnumeration<'a> {
    /// Set up an enumeration call. Nothing happens until
    /// [`TabletEnumeration::complete`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table_id: u64,
        requested_start_hash: KeyHash,
        actual_start_hash: KeyHash,
        actual_end_hash: KeyHash,
        max_payload_bytes: u32,
        log: &'a dyn ObjectLog,
        object_map: &'a dyn ObjectMap,
    ) -> Self {
        Self {
            table_id,
            requested_start_hash,
            actual_start_hash,
            actual_end_hash,
            max_payload_bytes,
            log,
            object_map,
        }
    }

    /// Run the call: fill `payload`, update `iter`, and return the
    /// tablet start hash the client should request next. The returned
    /// hash equals the requested one until this tablet is exhausted,
    /// then advances past `actual_end_hash` (wrapping to zero at the
    /// end of the key space).
    pub fn complete(
        &self,
        iter: &mut EnumerationIterator,
        payload: &mut BytesMut,
    ) -> KeyHash {
        // A new frame is needed whenever the tablet configuration
        // changed since the last call (first call, migration, resize).
        let num_buckets = self.object_map.num_buckets();
        let needs_frame = match iter.top() {
            None => true,
            Some(top) => {
                top.tablet_start_hash != self.actual_start_hash
                    || top.tablet_end_hash != self.actual_end_hash
                    || top.num_buckets != num_buckets
            }
        };
        if needs_frame {
            iter.push(Frame::new(
                self.actual_start_hash,
                self.actual_end_hash,
                num_buckets,
            ));
        }

        let initial_payload_len = payload.len();
        let first_bucket = iter.top().expect("frame pushed above").bucket_index;
        let mut current_bucket = first_bucket;
        while current_bucket < num_buckets {
            let mut objects = self.collect_bucket(iter, current_bucket);
            let bucket_start = payload.len();
            if self.append_objects(payload, &objects).is_some() {
                // The whole bucket must go out in one call or be
                // re-sorted; drop the partial tail.
                payload.truncate(bucket_start);

                // If not even the first bucket of this call fit, sort
                // it by key hash and emit the longest prefix that does,
                // recording where to resume inside the bucket.
                if current_bucket == first_bucket {
                    objects.sort_by_key(|object| object.key_hash);
                    if let Some(first_unsent) = self.append_objects(payload, &objects) {
                        iter.top_mut().expect("frame pushed above").bucket_next_hash =
                            objects[first_unsent].key_hash;
                    }
                }
                break;
            }
            current_bucket += 1;
        }

        // The next call resumes at the first bucket not fully emitted.
        iter.top_mut().expect("frame pushed above").bucket_index = current_bucket;

        let mut next_tablet_start_hash = self.requested_start_hash;
        if current_bucket >= num_buckets && payload.len() == initial_payload_len {
            // Tablet exhausted: discard frames this tablet covered and
            // point the client past our range.
            while iter
                .top()
                .map_or(false, |top| top.tablet_end_hash <= self.actual_end_hash)
            {
                iter.pop();
            }
            next_tablet_start_hash = self.actual_end_hash.wrapping_add(1);
        }
        next_tablet_start_hash
    }

    /// Gather the bucket's objects that still need emission.
    fn collect_bucket(&self, iter: &EnumerationIterator, bucket: u64) -> Vec<ObjectView> {
        let mut objects = Vec::new();
        self.object_map.for_each_in_bucket(bucket, &mut |reference| {
            let object = match self.log.object(reference) {
                Some(object) => object,
                None => return,
            };
            if self.filter(iter, &object) {
                objects.push(object);
            }
        });
        objects
    }

    /// Decide whether an object belongs in this call's output.
    fn filter(&self, iter: &EnumerationIterator, object: &ObjectView) -> bool {
        let top = iter.top().expect("filter runs with a frame pushed");
        let key_hash = object.key_hash;

        if object.table_id != self.table_id
            || key_hash < self.requested_start_hash
            || key_hash > top.tablet_end_hash
        {
            return false;
        }

        // An object already emitted under an older configuration is
        // covered by some non-top frame: its hash range contains the
        // key and the key's bucket position under that frame's bucket
        // count is strictly before the frame's recorded progress.
        for index in (0..iter.len().saturating_sub(1)).rev() {
            let frame = iter.get(index).expect("index below len");
            if frame.tablet_start_hash <= key_hash && key_hash <= frame.tablet_end_hash {
                let position = bucket_index(frame.num_buckets, key_hash);
                if position < frame.bucket_index
                    || (position == frame.bucket_index && key_hash < frame.bucket_next_hash)
                {
                    return false;
                }
            }
        }

        // Resuming inside an oversized bucket: skip what already went out.
        key_hash >= top.bucket_next_hash
    }

    /// Append objects as `u32 length || bytes` records until the next
    /// would overflow the payload limit. Returns the index of the first
    /// object that did not fit.
    fn append_objects(&self, payload: &mut BytesMut, objects: &[ObjectView]) -> Option<usize> {
        for (index, object) in objects.iter().enumerate() {
            let length = object.data.len();
            if payload.len() + 4 + length > self.max_payload_bytes as usize {
                return Some(index);
            }
            payload.put_u32_le(length as u32);
            payload.put_slice(&object.data);
        }
        None
    }
}
