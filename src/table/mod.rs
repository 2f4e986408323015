/*! A Robin-Hood open-addressed hash table with bounded displacement.

The table stores packed `(hash, key, value)` entries in a flat backing of
`2 × size` slots; the extra half absorbs probe-chain overflow so insertion
never wraps. A hash maps to its primary slot by `⌊hash · size / 2³²⌋`, and
entries may sit at most [`max_displacement`] slots to the right of their
primary slot, an invariant that both point lookups and the batch
[`LookupStreamer`] exploit.

Distinguishing features over a general-purpose map:

 * displacement tracking makes worst-case probe length explicit;
 * a streaming multi-lookup amortizes hashing and memory traffic over a
   batch of keys;
 * tables serialize to a bit-exact snapshot and load back [`CTable::load`];
 * each table owns a 128-bit hash seed, replaced on every resize, with a
   `RANDOM_SEED` environment override for reproducible tests.

Keys and values are plain byte records ([`Record`]) with sizes fixed at
compile time.

[`max_displacement`]: struct.CTable.html#method.max_displacement
[`LookupStreamer`]: struct.LookupStreamer.html
[`CTable::load`]: struct.CTable.html#method.load
[`Record`]: trait.Record.html
*/
use core::fmt;
use core::mem;

use byteorder::{ByteOrder, LittleEndian};

mod backing;
mod hash;
mod snapshot;
mod stream;

pub use self::backing::{AllocError, Backing, HUGEPAGE_THRESHOLD};
pub use self::hash::{hash_bytes, hash_lanes, Seed, EMPTY_HASH};
pub use self::stream::LookupStreamer;

/// Largest key size the stack-side hashing path accepts.
const MAX_KEY_SIZE: usize = 64;

/// A plain-old-data record: fixed size, byte-copyable, with an explicit
/// little-endian encoding for the snapshot format.
pub trait Record: Copy + PartialEq {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Write exactly [`SIZE`](#associatedconstant.SIZE) bytes.
    fn write_to(&self, bytes: &mut [u8]);

    /// Read back what `write_to` wrote.
    fn read_from(bytes: &[u8]) -> Self;
}

impl Record for u16 {
    const SIZE: usize = 2;

    fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u16(bytes, *self)
    }

    fn read_from(bytes: &[u8]) -> Self {
        LittleEndian::read_u16(bytes)
    }
}

impl Record for u32 {
    const SIZE: usize = 4;

    fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(bytes, *self)
    }

    fn read_from(bytes: &[u8]) -> Self {
        LittleEndian::read_u32(bytes)
    }
}

impl Record for u64 {
    const SIZE: usize = 8;

    fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u64(bytes, *self)
    }

    fn read_from(bytes: &[u8]) -> Self {
        LittleEndian::read_u64(bytes)
    }
}

/// One table slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry<K, V> {
    /// The key's hash, or [`EMPTY_HASH`](constant.EMPTY_HASH.html) for a
    /// free slot.
    pub hash: u32,
    pub key: K,
    pub value: V,
}

/// What `add` may do when it finds, or fails to find, the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The key must be absent.
    Insert,
    /// Insert or overwrite, whichever applies.
    InsertOrUpdate,
    /// The key must already be present.
    Update,
}

/// The error type for table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `add` in insert-only mode found the key. A caller bug.
    KeyPresent,
    /// `update` or strict `remove` did not find the key. A caller bug.
    KeyAbsent,
    /// The backing store could not be grown; the table is unchanged.
    Alloc(AllocError),
}

/// The result type for table operations.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::KeyPresent => write!(f, "key already present"),
            Error::KeyAbsent => write!(f, "key not found"),
            Error::Alloc(inner) => inner.fmt(f),
        }
    }
}

impl From<AllocError> for Error {
    fn from(inner: AllocError) -> Error {
        Error::Alloc(inner)
    }
}

/// Construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    /// Primary slot count to start from. Also the floor below which removal
    /// never shrinks the table.
    pub initial_size: u32,
    /// Fraction of `size` the occupancy may reach before doubling.
    pub max_occupancy_rate: f64,
    /// Fraction of `size` below which removal halves the table. Zero
    /// disables shrinking.
    pub min_occupancy_rate: f64,
    /// Hash seed; `None` draws one per the `RANDOM_SEED` policy.
    pub seed: Option<Seed>,
}

impl Default for Params {
    fn default() -> Params {
        Params {
            initial_size: 8,
            max_occupancy_rate: 0.9,
            min_occupancy_rate: 0.0,
            seed: None,
        }
    }
}

/// The table itself. See the [module documentation](index.html).
pub struct CTable<K: Record + Default, V: Record + Default> {
    entries: Backing<Entry<K, V>>,
    size: u32,
    occupancy: u32,
    max_displacement: u32,
    occupancy_hi: u32,
    occupancy_lo: u32,
    seed: Seed,
    max_occupancy_rate: f64,
    min_occupancy_rate: f64,
    initial_size: u32,
}

impl<K: Record + Default, V: Record + Default> CTable<K, V> {
    /// Create a table.
    ///
    /// # Panics
    /// Panics on nonsensical parameters: a max occupancy rate outside
    /// `(0, 1)`, a min rate that is not below half the max rate (halving
    /// would immediately re-trigger growth), or a key too large to hash.
    pub fn new(params: Params) -> Result<CTable<K, V>> {
        assert!(K::SIZE <= MAX_KEY_SIZE);
        assert!(params.max_occupancy_rate > 0.0 && params.max_occupancy_rate < 1.0);
        assert!(params.min_occupancy_rate >= 0.0);
        assert!(params.min_occupancy_rate < params.max_occupancy_rate / 2.0);

        let size = params.initial_size.max(2);
        let seed = params.seed.unwrap_or_else(Seed::fresh);
        Ok(CTable {
            entries: Self::allocate_entries(size)?,
            size,
            occupancy: 0,
            max_displacement: 0,
            occupancy_hi: (size as f64 * params.max_occupancy_rate) as u32,
            occupancy_lo: (size as f64 * params.min_occupancy_rate) as u32,
            seed,
            max_occupancy_rate: params.max_occupancy_rate,
            min_occupancy_rate: params.min_occupancy_rate,
            initial_size: size,
        })
    }

    fn allocate_entries(size: u32) -> core::result::Result<Backing<Entry<K, V>>, AllocError> {
        let empty = Entry {
            hash: EMPTY_HASH,
            key: K::default(),
            value: V::default(),
        };
        Backing::allocate(2 * size as usize, empty)
    }

    /// Occupied entries.
    pub fn occupancy(&self) -> u32 {
        self.occupancy
    }

    /// Primary slot count.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Upper bound on how far any present key sits from its primary slot.
    ///
    /// The bound is monotone between resizes: removal does not lower it.
    pub fn max_displacement(&self) -> u32 {
        self.max_displacement
    }

    /// The current hash seed.
    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    /// Total slots, including the overflow half.
    pub fn slots(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn raw_entries(&self) -> &[Entry<K, V>] {
        &self.entries
    }

    pub(crate) fn primary(&self, hash: u32) -> usize {
        ((hash as u64 * self.size as u64) >> 32) as usize
    }

    pub(crate) fn hash_key(&self, key: &K) -> u32 {
        let mut buf = [0u8; MAX_KEY_SIZE];
        key.write_to(&mut buf[..K::SIZE]);
        hash::hash_bytes(&self.seed, &buf[..K::SIZE])
    }

    /// Insert, overwrite or assert-present per `mode`; returns the slot
    /// index, valid until the next mutating call.
    pub fn add(&mut self, key: K, value: V, mode: Mode) -> Result<usize> {
        if self.occupancy + 1 > self.occupancy_hi {
            let doubled = self.size.checked_mul(2).ok_or(Error::Alloc(AllocError))?;
            net_debug!(
                "ctable at occupancy {} of {}, doubling to {}",
                self.occupancy, self.size, doubled
            );
            self.resize(doubled)?;
        }

        let h = self.hash_key(&key);
        let start = self.primary(h);
        let mut index = start;

        // Skip entries of poorer hashes, then scan the equal-hash run.
        while self.entries[index].hash < h {
            index += 1;
        }
        while self.entries[index].hash == h {
            if self.entries[index].key == key {
                return match mode {
                    Mode::Insert => Err(Error::KeyPresent),
                    Mode::InsertOrUpdate | Mode::Update => {
                        self.entries[index].value = value;
                        Ok(index)
                    }
                };
            }
            index += 1;
        }
        if let Mode::Update = mode {
            return Err(Error::KeyAbsent);
        }

        if self.entries[index].hash != EMPTY_HASH {
            // A richer run is in the way: shift it one slot right into the
            // nearest gap, tracking every displacement that grows.
            let mut gap = index;
            while self.entries[gap].hash != EMPTY_HASH {
                gap += 1;
            }
            while gap > index {
                self.entries[gap] = self.entries[gap - 1];
                let natural = self.primary(self.entries[gap].hash);
                self.max_displacement = self.max_displacement.max((gap - natural) as u32);
                gap -= 1;
            }
        }

        self.entries[index] = Entry { hash: h, key, value };
        self.max_displacement = self.max_displacement.max((index - start) as u32);
        self.occupancy += 1;
        Ok(index)
    }

    /// Overwrite the value of an existing key.
    pub fn update(&mut self, key: K, value: V) -> Result<usize> {
        self.add(key, value, Mode::Update)
    }

    fn probe(&self, h: u32, key: &K) -> Option<usize> {
        let mut index = self.primary(h);
        while self.entries[index].hash < h {
            index += 1;
        }
        while self.entries[index].hash == h {
            if self.entries[index].key == *key {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// The slot index holding `key`, valid until the next mutating call.
    pub fn lookup(&self, key: &K) -> Option<usize> {
        self.probe(self.hash_key(key), key)
    }

    /// A reference into the table, valid until the next mutating call.
    pub fn lookup_ptr(&self, key: &K) -> Option<&Entry<K, V>> {
        self.lookup(key).map(|index| &self.entries[index])
    }

    /// As [`lookup_ptr`](#method.lookup_ptr), mutably.
    pub fn lookup_mut(&mut self, key: &K) -> Option<&mut Entry<K, V>> {
        match self.lookup(key) {
            Some(index) => Some(&mut self.entries[index]),
            None => None,
        }
    }

    /// Copy the found entry into `out`; returns whether it was found.
    pub fn lookup_and_copy(&self, key: &K, out: &mut Entry<K, V>) -> bool {
        match self.lookup_ptr(key) {
            Some(entry) => {
                *out = *entry;
                true
            }
            None => false,
        }
    }

    /// The entry at a slot index, if the slot is occupied.
    pub fn entry(&self, index: usize) -> Option<&Entry<K, V>> {
        self.entries.get(index).filter(|e| e.hash != EMPTY_HASH)
    }

    /// As [`entry`](#method.entry), mutably. The key and hash must be left
    /// alone; only the value is the caller's to change.
    pub fn entry_mut(&mut self, index: usize) -> Option<&mut Entry<K, V>> {
        self.entries.get_mut(index).filter(|e| e.hash != EMPTY_HASH)
    }

    /// Remove `key`. With `missing_allowed`, an absent key returns
    /// `Ok(false)` instead of erroring.
    pub fn remove(&mut self, key: &K, missing_allowed: bool) -> Result<bool> {
        let h = self.hash_key(key);
        match self.probe(h, key) {
            Some(index) => {
                self.remove_at(index);
                Ok(true)
            }
            None if missing_allowed => Ok(false),
            None => Err(Error::KeyAbsent),
        }
    }

    /// Remove the entry at a previously obtained slot index.
    ///
    /// Backward-shift deletion: displaced successors slide one slot left
    /// until an empty slot or an entry already at its primary position.
    /// `max_displacement` is deliberately not lowered.
    ///
    /// # Panics
    /// Panics if the slot is empty.
    pub fn remove_at(&mut self, mut index: usize) {
        assert!(
            self.entries[index].hash != EMPTY_HASH,
            "removal of an empty slot"
        );
        loop {
            let next = index + 1;
            if next >= self.entries.len() {
                break;
            }
            let next_hash = self.entries[next].hash;
            if next_hash == EMPTY_HASH || self.primary(next_hash) >= next {
                break;
            }
            self.entries[index] = self.entries[next];
            index = next;
        }
        self.entries[index].hash = EMPTY_HASH;
        self.occupancy -= 1;

        if self.occupancy < self.occupancy_lo && self.size > self.initial_size {
            let halved = self.size / 2;
            net_debug!(
                "ctable at occupancy {} of {}, halving to {}",
                self.occupancy, self.size, halved
            );
            if self.resize(halved).is_err() {
                // Shrinking is advisory; a failed halving keeps the table.
                net_debug!("ctable shrink failed, keeping current backing");
            }
        }
    }

    /// Rebuild at `new_size` primary slots with a fresh seed.
    ///
    /// The only operation that changes the seed; every previously obtained
    /// index or entry reference is invalidated. On allocation failure the
    /// table is left unchanged.
    pub fn resize(&mut self, new_size: u32) -> Result<()> {
        assert!(new_size >= 2);
        let fresh = Self::allocate_entries(new_size)?;
        let old = mem::replace(&mut self.entries, fresh);

        self.seed = Seed::fresh();
        self.size = new_size;
        self.occupancy = 0;
        self.max_displacement = 0;
        self.occupancy_hi = (new_size as f64 * self.max_occupancy_rate) as u32;
        self.occupancy_lo = (new_size as f64 * self.min_occupancy_rate) as u32;

        for entry in old.iter() {
            if entry.hash != EMPTY_HASH {
                // Cannot recurse: the carried occupancy fits the watermarks
                // of the size we are moving to.
                self.add(entry.key, entry.value, Mode::Insert)?;
            }
        }
        Ok(())
    }

    /// Iterate the occupied entries.
    ///
    /// The sequence is finite and lazily produced; holding it borrows the
    /// table, so it cannot outlive a mutation.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            entries: &self.entries,
            index: 0,
        }
    }
}

/// Iterator over occupied entries, in slot order.
pub struct Iter<'a, K, V> {
    entries: &'a [Entry<K, V>],
    index: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = &'a Entry<K, V>;

    fn next(&mut self) -> Option<&'a Entry<K, V>> {
        while self.index < self.entries.len() {
            let entry = &self.entries[self.index];
            self.index += 1;
            if entry.hash != EMPTY_HASH {
                return Some(entry);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> CTable<u32, u64> {
        CTable::new(Params {
            initial_size: 8,
            seed: Some(Seed::deterministic(1, 0)),
            ..Params::default()
        })
        .unwrap()
    }

    fn check_invariants(table: &CTable<u32, u64>) {
        let mut seen = 0;
        for index in 0..table.slots() {
            if let Some(entry) = table.entry(index) {
                seen += 1;
                let natural = table.primary(entry.hash);
                assert!(natural <= index, "entry left of its primary slot");
                assert!(
                    index - natural <= table.max_displacement() as usize,
                    "displacement {} exceeds bound {}",
                    index - natural,
                    table.max_displacement()
                );
            }
        }
        assert_eq!(seen, table.occupancy());
    }

    #[test]
    fn test_add_lookup_remove() {
        let mut table = small_table();
        for i in 0..1000u32 {
            table.add(i, u64::from(i) * 3, Mode::Insert).unwrap();
        }
        check_invariants(&table);

        for i in 0..1000u32 {
            let entry = table.lookup_ptr(&i).expect("key present");
            assert_eq!(entry.value, u64::from(i) * 3);
        }
        assert!(table.lookup_ptr(&1000).is_none());

        for i in (0..1000u32).step_by(2) {
            assert_eq!(table.remove(&i, false), Ok(true));
        }
        check_invariants(&table);
        for i in 0..1000u32 {
            assert_eq!(table.lookup_ptr(&i).is_some(), i % 2 == 1);
        }
    }

    #[test]
    fn test_modes() {
        let mut table = small_table();
        table.add(7, 1, Mode::Insert).unwrap();
        assert_eq!(table.add(7, 2, Mode::Insert), Err(Error::KeyPresent));
        assert_eq!(table.lookup_ptr(&7).unwrap().value, 1);

        table.add(7, 2, Mode::InsertOrUpdate).unwrap();
        assert_eq!(table.lookup_ptr(&7).unwrap().value, 2);

        table.update(7, 3).unwrap();
        assert_eq!(table.lookup_ptr(&7).unwrap().value, 3);

        assert_eq!(table.update(8, 1), Err(Error::KeyAbsent));
        assert_eq!(table.remove(&8, true), Ok(false));
        assert_eq!(table.remove(&8, false), Err(Error::KeyAbsent));
    }

    #[test]
    fn test_update_survives_churn() {
        // Interleave inserts, updates and removes; the latest write wins.
        let mut table = small_table();
        for round in 0..5u64 {
            for i in 0..300u32 {
                table.add(i, u64::from(i) + round, Mode::InsertOrUpdate).unwrap();
            }
            for i in (0..300u32).filter(|i| i % 3 == 0) {
                table.remove(&i, false).unwrap();
            }
            for i in (0..300u32).filter(|i| i % 3 == 0) {
                table.add(i, u64::from(i) + round + 7, Mode::Insert).unwrap();
            }
            check_invariants(&table);
        }
        for i in 0..300u32 {
            let expect = if i % 3 == 0 { u64::from(i) + 11 } else { u64::from(i) + 4 };
            assert_eq!(table.lookup_ptr(&i).unwrap().value, expect);
        }
    }

    #[test]
    fn test_growth_reseeds() {
        let mut table = small_table();
        let seed_before = *table.seed();
        let size_before = table.size();
        for i in 0..100u32 {
            table.add(i, 0, Mode::Insert).unwrap();
        }
        assert!(table.size() > size_before);
        assert_ne!(*table.seed(), seed_before);
        check_invariants(&table);
    }

    #[test]
    fn test_shrink_on_removal() {
        let mut table: CTable<u32, u64> = CTable::new(Params {
            initial_size: 8,
            max_occupancy_rate: 0.9,
            min_occupancy_rate: 0.2,
            seed: Some(Seed::deterministic(2, 0)),
        })
        .unwrap();

        for i in 0..500u32 {
            table.add(i, 0, Mode::Insert).unwrap();
        }
        let grown = table.size();
        for i in 0..500u32 {
            table.remove(&i, false).unwrap();
        }
        assert!(table.size() < grown);
        assert_eq!(table.occupancy(), 0);
        check_invariants(&table);
    }

    #[test]
    fn test_iterate_matches_contents() {
        let mut table = small_table();
        for i in 0..256u32 {
            table.add(i, u64::from(i), Mode::Insert).unwrap();
        }
        let mut keys: Vec<u32> = table.iter().map(|e| e.key).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..256).collect::<Vec<_>>());
    }

    #[test]
    fn test_lookup_and_copy() {
        let mut table = small_table();
        table.add(5, 55, Mode::Insert).unwrap();
        let mut out = Entry { hash: EMPTY_HASH, key: 0u32, value: 0u64 };
        assert!(table.lookup_and_copy(&5, &mut out));
        assert_eq!((out.key, out.value), (5, 55));
        assert!(!table.lookup_and_copy(&6, &mut out));
    }
}
