//! Batch lookup.
//!
//! A [`LookupStreamer`] amortizes the three costs of a point lookup
//! (hashing, the dependent loads of the probe walk, and key comparison)
//! across a batch of `width` keys by running each as its own fused pass:
//! hash every lane, copy every lane's probe window into a dense scratch
//! area, then binary-search the windows.
//!
//! [`LookupStreamer`]: struct.LookupStreamer.html
use super::{hash, CTable, Entry, Record, EMPTY_HASH};

/// Scratch state for streaming lookups of `width` keys at a time.
///
/// The probe windows copied in pass two span `max_displacement + 1` entries
/// per lane, which by the table's displacement invariant is where a present
/// key must be. Results reflect the table as of the last [`stream`] call;
/// any mutation of the table in between invalidates them (the borrow checker
/// enforces the absence of interleaving, the recomputed window size handles
/// a resize).
///
/// [`stream`]: #method.stream
pub struct LookupStreamer<K: Record + Default, V: Record + Default> {
    width: usize,
    keys: Vec<K>,
    packed: Vec<u8>,
    hashes: Vec<u32>,
    stride: usize,
    scratch: Vec<Entry<K, V>>,
}

impl<K: Record + Default, V: Record + Default> CTable<K, V> {
    /// A streamer for batches of `width` keys.
    pub fn make_lookup_streamer(&self, width: usize) -> LookupStreamer<K, V> {
        assert!(width > 0);
        LookupStreamer {
            width,
            keys: vec![K::default(); width],
            packed: vec![0u8; width * K::SIZE],
            hashes: vec![0u32; width],
            stride: 1,
            scratch: vec![Self::empty_entry(); width + 1],
        }
    }

    pub(crate) fn empty_entry() -> Entry<K, V> {
        Entry {
            hash: EMPTY_HASH,
            key: K::default(),
            value: V::default(),
        }
    }
}

impl<K: Record + Default, V: Record + Default> LookupStreamer<K, V> {
    /// Lanes per batch.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Place a key in a lane.
    pub fn set_key(&mut self, lane: usize, key: K) {
        self.keys[lane] = key;
    }

    /// Look up every lane against `table`.
    pub fn stream(&mut self, table: &CTable<K, V>) {
        // Pass 1: hash all lanes over the packed key bytes.
        for (lane, key) in self.keys.iter().enumerate() {
            key.write_to(&mut self.packed[lane * K::SIZE..(lane + 1) * K::SIZE]);
        }
        hash::hash_lanes(table.seed(), &self.packed, K::SIZE, &mut self.hashes);

        // Pass 2: copy each lane's probe window into the scratch area.
        let stride = table.max_displacement() as usize + 1;
        self.stride = stride;
        self.scratch.clear();
        self.scratch.resize(self.width * stride + 1, CTable::<K, V>::empty_entry());
        let entries = table.raw_entries();
        for lane in 0..self.width {
            let start = table.primary(self.hashes[lane]);
            let end = (start + stride).min(entries.len());
            let window = &entries[start..end];
            self.scratch[lane * stride..lane * stride + window.len()].copy_from_slice(window);
        }

        // Pass 3: binary-search each window for the lane's hash, then
        // verify the key within the equal-hash run. A miss leaves the
        // sentinel in the lane's result slot.
        for lane in 0..self.width {
            let h = self.hashes[lane];
            let found = {
                let window = &self.scratch[lane * stride..(lane + 1) * stride];
                let mut at = window.partition_point(|entry| entry.hash < h);
                let mut found = None;
                while at < window.len() && window[at].hash == h {
                    if window[at].key == self.keys[lane] {
                        found = Some(window[at]);
                        break;
                    }
                    at += 1;
                }
                found
            };
            let result = &mut self.scratch[lane * stride];
            match found {
                Some(entry) => *result = entry,
                None => result.hash = EMPTY_HASH,
            }
        }
    }

    /// Whether the last [`stream`](#method.stream) found this lane's key.
    pub fn is_found(&self, lane: usize) -> bool {
        self.scratch[lane * self.stride].hash != EMPTY_HASH
    }

    /// The entry found for this lane, if any.
    pub fn entry(&self, lane: usize) -> Option<&Entry<K, V>> {
        let result = &self.scratch[lane * self.stride];
        if result.hash == EMPTY_HASH {
            None
        } else {
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Mode, Params, Seed};
    use super::*;

    fn populated(count: u32) -> CTable<u32, u64> {
        let mut table = CTable::new(Params {
            initial_size: 8,
            seed: Some(Seed::deterministic(11, 0)),
            ..Params::default()
        })
        .unwrap();
        for i in 0..count {
            table.add(i, u64::from(i) ^ 0xabcd, Mode::Insert).unwrap();
        }
        table
    }

    #[test]
    fn matches_pointwise_lookup() {
        let table = populated(100_000);
        let mut streamer = table.make_lookup_streamer(32);

        // 30 present keys and 2 absent ones, as a worked batch.
        for lane in 0..30 {
            streamer.set_key(lane, (lane as u32) * 1013);
        }
        streamer.set_key(30, 200_000);
        streamer.set_key(31, 300_001);

        streamer.stream(&table);

        for lane in 0..30 {
            let key = (lane as u32) * 1013;
            assert!(streamer.is_found(lane), "lane {} should hit", lane);
            let entry = streamer.entry(lane).unwrap();
            assert_eq!(entry.key, key);
            assert_eq!(entry.value, table.lookup_ptr(&key).unwrap().value);
        }
        assert!(!streamer.is_found(30));
        assert!(!streamer.is_found(31));
        assert!(streamer.entry(30).is_none());
    }

    #[test]
    fn agrees_after_churn() {
        let mut table = populated(4096);
        for i in (0..4096u32).step_by(3) {
            table.remove(&i, false).unwrap();
        }

        let mut streamer = table.make_lookup_streamer(16);
        for batch in 0..64u32 {
            for lane in 0..16 {
                streamer.set_key(lane, batch * 16 + lane as u32);
            }
            streamer.stream(&table);
            for lane in 0..16 {
                let key = batch * 16 + lane as u32;
                let pointwise = table.lookup_ptr(&key);
                assert_eq!(streamer.is_found(lane), pointwise.is_some());
                if let Some(entry) = pointwise {
                    assert_eq!(streamer.entry(lane).unwrap().value, entry.value);
                }
            }
        }
    }

    #[test]
    fn survives_a_resize_between_batches() {
        let mut table = populated(64);
        let mut streamer = table.make_lookup_streamer(4);
        streamer.set_key(0, 1);
        streamer.stream(&table);
        assert!(streamer.is_found(0));

        // Growing rehashes with a new seed and a new displacement bound.
        for i in 64..4096u32 {
            table.add(i, 0, Mode::Insert).unwrap();
        }
        streamer.stream(&table);
        assert!(streamer.is_found(0));
        assert_eq!(streamer.entry(0).unwrap().value, 1 ^ 0xabcd);
    }
}
