//! The approximate per-address count cache.
//!
//! A fixed array of four-way set-associative cache lines holding
//! `(tag, count)` pairs. The line index and the tag are the two halves of
//! the [cipher]'s permutation of the address, so a tag match within a line
//! identifies the address exactly; distinct addresses can only compete for
//! the four ways of a shared line, never impersonate each other.
//!
//! [cipher]: ../cipher/struct.Cipher.html
use crate::table::{AllocError, Backing};
use crate::wire::Ipv4Address;

use super::cipher::Cipher;

const WAYS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Way {
    tag: u16,
    count: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Line {
    ways: [Way; WAYS],
}

/// The cache proper. Allocated once, never resized.
pub struct AddressCache {
    lines: Backing<Line>,
    cipher: Cipher,
    index_bits: u32,
    c_min: i16,
    c_max: i16,
}

impl AddressCache {
    /// Allocate `lines` cache lines.
    ///
    /// # Panics
    /// Panics unless `lines` is a power of two of at least 2¹⁶: the index
    /// must consume enough permutation bits for the remaining tag bits to
    /// fit sixteen.
    pub fn new(lines: usize, seed: u64, c_min: i16, c_max: i16) -> Result<AddressCache, AllocError> {
        assert!(lines.is_power_of_two());
        assert!(lines >= 1 << 16);
        assert!(c_min < c_max);
        Ok(AddressCache {
            lines: Backing::allocate(lines, Line::default())?,
            cipher: Cipher::new(seed),
            index_bits: lines.trailing_zeros(),
            c_min,
            c_max,
        })
    }

    fn split(&self, addr: Ipv4Address) -> (usize, u16) {
        let permuted = self.cipher.encrypt(addr.to_host_integer());
        let index = permuted as usize & (self.lines.len() - 1);
        let tag = (permuted >> self.index_bits) as u16;
        (index, tag)
    }

    /// The count for an address, zero if it is not cached.
    pub fn count(&self, addr: Ipv4Address) -> i16 {
        let (index, tag) = self.split(addr);
        for way in self.lines[index].ways.iter() {
            if way.tag == tag && way.count != 0 {
                return way.count;
            }
        }
        0
    }

    /// Store a count for an address.
    ///
    /// Writes at or beyond the clamp range are no-ops, which is what keeps
    /// stored counts inside `(c_min, c_max)`. With no matching tag and a
    /// full line, the way with the minimum count is evicted, so a blocked
    /// host's positive count survives the churn around it.
    pub fn set_count(&mut self, addr: Ipv4Address, count: i16) {
        if count >= self.c_max || count <= self.c_min {
            return;
        }
        let (index, tag) = self.split(addr);
        let line = &mut self.lines[index];
        match line.ways.iter_mut().find(|way| way.tag == tag && way.count != 0) {
            Some(way) => way.count = count,
            None => {
                let victim = line
                    .ways
                    .iter_mut()
                    .min_by_key(|way| way.count)
                    .expect("a line always has ways");
                *victim = Way { tag, count };
            }
        }
    }

    /// Walk every way and decrement the positive counts. An O(lines)
    /// sweep, amortized over the decay interval.
    pub fn decay(&mut self) {
        for line in self.lines.iter_mut() {
            for way in line.ways.iter_mut() {
                if way.count > 0 {
                    way.count -= 1;
                }
            }
        }
    }
}
