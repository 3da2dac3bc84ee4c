//! Reassembly of fragmented reliable messages.
//!
//! Large reliable messages arrive split across several `SendFragment`
//! commands. Each fragment payload carries its own 20-byte header naming the
//! fragment sequence id, the total fragment count, this fragment's index and
//! byte offset. Fragments may arrive out of order or more than once; a set is
//! complete the instant every index is present.
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::value::ByteReader;

const FRAGMENT_HEADER_LEN: usize = 20;

/// Incomplete sets older than this are swept on the next submit.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);
/// Hard cap on simultaneously tracked sets; the oldest set is evicted first.
const DEFAULT_CAPACITY: usize = 256;

struct FragmentSet {
    expected_count: i32,
    parts: HashMap<i32, Vec<u8>>,
    total_length: i32,
    first_seen: Instant,
}

/// Accumulates fragment payloads keyed by sequence id until complete.
///
/// Retention is bounded: sets that never complete are evicted by age and by
/// capacity, so a lossy capture cannot grow the buffer without limit. A late
/// fragment for an evicted sequence simply starts a fresh set.
pub struct FragmentBuffer {
    sets: HashMap<i32, FragmentSet>,
    max_age: Duration,
    capacity: usize,
}

impl Default for FragmentBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }
}

impl FragmentBuffer {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self { sets: HashMap::new(), max_age, capacity: capacity.max(1) }
    }

    pub fn pending(&self) -> usize {
        self.sets.len()
    }

    /// Submit one fragment command payload (header included).
    ///
    /// Returns the reassembled message the moment the set completes, removing
    /// the set from storage. Duplicate indices overwrite their slot.
    pub fn submit(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() < FRAGMENT_HEADER_LEN {
            return None;
        }
        let mut r = ByteReader::new(payload);
        // Seq(4), Count(4), Index(4), TotalLen(4), Offset(4)
        let sequence_id = r.read_i32("fragment sequence id").ok()?;
        let fragment_count = r.read_i32("fragment count").ok()?;
        let fragment_index = r.read_i32("fragment index").ok()?;
        let total_length = r.read_i32("fragment total length").ok()?;
        let _offset = r.read_i32("fragment offset").ok()?;
        let data = &payload[FRAGMENT_HEADER_LEN..];

        if fragment_count <= 0 || fragment_index < 0 || fragment_index >= fragment_count {
            debug!(sequence_id, fragment_count, fragment_index, "dropping malformed fragment");
            return None;
        }

        self.sweep_expired();
        // Capacity eviction only when this fragment starts a new set; a
        // fragment extending a tracked set must never evict that set.
        if !self.sets.contains_key(&sequence_id) {
            self.evict_to_capacity();
        }

        let set = self.sets.entry(sequence_id).or_insert_with(|| FragmentSet {
            expected_count: fragment_count,
            parts: HashMap::new(),
            total_length,
            first_seen: Instant::now(),
        });
        set.parts.insert(fragment_index, data.to_vec());

        if set.parts.len() as i32 == set.expected_count {
            let set = self.sets.remove(&sequence_id)?;
            let mut out = Vec::with_capacity(set.total_length.max(0) as usize);
            for i in 0..set.expected_count {
                // Complete by count, so every index in 0..count is present.
                out.extend_from_slice(set.parts.get(&i)?);
            }
            return Some(out);
        }
        None
    }

    fn sweep_expired(&mut self) {
        if self.sets.is_empty() {
            return;
        }
        let before = self.sets.len();
        let max_age = self.max_age;
        self.sets.retain(|_, set| set.first_seen.elapsed() <= max_age);
        let evicted = before - self.sets.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale fragment sets");
        }
    }

    fn evict_to_capacity(&mut self) {
        while self.sets.len() >= self.capacity {
            let Some((&oldest, _)) =
                self.sets.iter().min_by_key(|(_, set)| set.first_seen)
            else {
                break;
            };
            self.sets.remove(&oldest);
            debug!(sequence_id = oldest, "evicted fragment set at capacity");
        }
    }
}
