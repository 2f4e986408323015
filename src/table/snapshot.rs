//! Table snapshots.
//!
//! The on-disk layout is bit-exact and little-endian:
//!
//! ```text
//! [u32 size][u32 occupancy][u32 max_displacement][u8 × 16 hash seed]
//! [f64 max_occupancy_rate][f64 min_occupancy_rate]
//! [entry × (size + max_displacement)]
//! ```
//!
//! where an entry is `(u32 hash, key bytes, value bytes)` packed. The seed
//! travels with the table, so a loaded snapshot hashes exactly as the saved
//! table did. Slots past `size + max_displacement` are empty by the
//! displacement invariant and are not written.
use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{CTable, Record, Seed};

fn bad_data(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what)
}

impl<K: Record + Default, V: Record + Default> CTable<K, V> {
    /// Write the table to a stream.
    pub fn save<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u32::<LittleEndian>(self.occupancy)?;
        writer.write_u32::<LittleEndian>(self.max_displacement)?;
        writer.write_all(&self.seed.0)?;
        writer.write_f64::<LittleEndian>(self.max_occupancy_rate)?;
        writer.write_f64::<LittleEndian>(self.min_occupancy_rate)?;

        let mut buf = vec![0u8; 4 + K::SIZE + V::SIZE];
        for entry in &self.entries[..(self.size + self.max_displacement) as usize] {
            LittleEndian::write_u32(&mut buf[0..4], entry.hash);
            entry.key.write_to(&mut buf[4..4 + K::SIZE]);
            entry.value.write_to(&mut buf[4 + K::SIZE..]);
            writer.write_all(&buf)?;
        }
        Ok(())
    }

    /// Read back a table written by [`save`](#method.save).
    ///
    /// The key and value types must match the saved table; there is no type
    /// tag in the format, so a mismatch surfaces as garbage entries or an
    /// early end of stream.
    pub fn load<R: Read>(reader: &mut R) -> io::Result<CTable<K, V>> {
        let size = reader.read_u32::<LittleEndian>()?;
        let occupancy = reader.read_u32::<LittleEndian>()?;
        let max_displacement = reader.read_u32::<LittleEndian>()?;
        let mut seed = [0u8; 16];
        reader.read_exact(&mut seed)?;
        let max_occupancy_rate = reader.read_f64::<LittleEndian>()?;
        let min_occupancy_rate = reader.read_f64::<LittleEndian>()?;

        if size < 2 {
            return Err(bad_data("snapshot size below minimum"));
        }
        if !(max_occupancy_rate > 0.0 && max_occupancy_rate < 1.0) {
            return Err(bad_data("snapshot max occupancy rate out of range"));
        }
        if !(min_occupancy_rate >= 0.0 && min_occupancy_rate < max_occupancy_rate) {
            return Err(bad_data("snapshot min occupancy rate out of range"));
        }

        let mut entries =
            Self::allocate_entries(size).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let stored = (size as usize)
            .checked_add(max_displacement as usize)
            .ok_or_else(|| bad_data("snapshot displacement overflow"))?;
        if stored > entries.len() {
            return Err(bad_data("snapshot displacement exceeds backing"));
        }

        let mut buf = vec![0u8; 4 + K::SIZE + V::SIZE];
        for slot in &mut entries[..stored] {
            reader.read_exact(&mut buf)?;
            slot.hash = LittleEndian::read_u32(&buf[0..4]);
            slot.key = K::read_from(&buf[4..4 + K::SIZE]);
            slot.value = V::read_from(&buf[4 + K::SIZE..]);
        }

        Ok(CTable {
            entries,
            size,
            occupancy,
            max_displacement,
            occupancy_hi: (size as f64 * max_occupancy_rate) as u32,
            occupancy_lo: (size as f64 * min_occupancy_rate) as u32,
            seed: Seed(seed),
            max_occupancy_rate,
            min_occupancy_rate,
            initial_size: size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Mode, Params};
    use super::*;

    fn populated(count: u32) -> CTable<u32, u64> {
        let mut table = CTable::new(Params {
            initial_size: 8,
            seed: Some(Seed::deterministic(23, 0)),
            ..Params::default()
        })
        .unwrap();
        for i in 0..count {
            table.add(i, u64::from(i).wrapping_mul(0x9e37), Mode::Insert).unwrap();
        }
        table
    }

    #[test]
    fn roundtrip_is_identical() {
        let table = populated(200_000);
        let mut bytes = Vec::new();
        table.save(&mut bytes).unwrap();

        let loaded = CTable::<u32, u64>::load(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded.occupancy(), table.occupancy());
        assert_eq!(loaded.size(), table.size());
        assert!(loaded.max_displacement() <= table.max_displacement());

        let mut original: Vec<(u32, u64)> = table.iter().map(|e| (e.key, e.value)).collect();
        let mut restored: Vec<(u32, u64)> = loaded.iter().map(|e| (e.key, e.value)).collect();
        original.sort_unstable();
        restored.sort_unstable();
        assert_eq!(original, restored);

        // The seed travels with the snapshot, so lookups keep working.
        for key in [0u32, 1, 77_777, 199_999] {
            assert_eq!(
                loaded.lookup_ptr(&key).unwrap().value,
                table.lookup_ptr(&key).unwrap().value
            );
        }
        assert!(loaded.lookup_ptr(&200_000).is_none());
    }

    #[test]
    fn loaded_table_accepts_mutation() {
        let table = populated(100);
        let mut bytes = Vec::new();
        table.save(&mut bytes).unwrap();

        let mut loaded = CTable::<u32, u64>::load(&mut bytes.as_slice()).unwrap();
        loaded.add(1000, 1, Mode::Insert).unwrap();
        loaded.remove(&1, false).unwrap();
        assert_eq!(loaded.occupancy(), 100);
        assert!(loaded.lookup_ptr(&1000).is_some());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let table = populated(100);
        let mut bytes = Vec::new();
        table.save(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(CTable::<u32, u64>::load(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn header_sanity_is_checked() {
        let mut bytes = Vec::new();
        populated(10).save(&mut bytes).unwrap();
        // Corrupt the occupancy-rate field into nonsense.
        let rate_at = 4 + 4 + 4 + 16;
        bytes[rate_at..rate_at + 8].copy_from_slice(&2.0f64.to_le_bytes());
        assert!(CTable::<u32, u64>::load(&mut bytes.as_slice()).is_err());
    }
}
