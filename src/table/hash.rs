//! Seeded SipHash-1-2 for table keys.
//!
//! Hash function SipHash from:
//!
//! > SipHash: a fast short-input PRF. Jean-Philippe Aumasson and Daniel J.
//! > Bernstein
//!
//! run with one compression and two finalization rounds, which is plenty for
//! bucket scattering while staying keyed against hash flooding. The 64-bit
//! output is folded to 32 bits and the all-ones value is remapped, so the
//! result never collides with the empty-slot sentinel.
use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};

/// The slot sentinel; no key ever hashes to it.
pub const EMPTY_HASH: u32 = 0xffff_ffff;

// Yes, that's the initial values.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

/// A 128-bit hash key.
///
/// Every table owns one and replaces it on resize. With the `RANDOM_SEED`
/// environment variable set, seeds derive deterministically from its value
/// and a process-wide counter; otherwise they come from the OS generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed(pub [u8; 16]);

static SEED_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl Seed {
    /// Produce the next seed, honoring `RANDOM_SEED`.
    pub fn fresh() -> Seed {
        let sequence = SEED_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        match std::env::var("RANDOM_SEED") {
            Ok(value) => {
                let base = value
                    .trim()
                    .parse::<u64>()
                    .unwrap_or_else(|_| value.bytes().fold(0u64, |a, b| {
                        a.wrapping_mul(31).wrapping_add(b as u64)
                    }));
                Seed::deterministic(base, sequence)
            }
            Err(_) => {
                let mut bytes = [0u8; 16];
                OsRng.fill_bytes(&mut bytes);
                Seed(bytes)
            }
        }
    }

    /// The `n`th reproducible seed for a given base.
    pub fn deterministic(base: u64, n: u64) -> Seed {
        let mut bytes = [0u8; 16];
        LittleEndian::write_u64(&mut bytes[0..8], splitmix(base.wrapping_add(n)));
        LittleEndian::write_u64(&mut bytes[8..16], splitmix(base.wrapping_add(n) ^ 0x9e37_79b9_7f4a_7c15));
        Seed(bytes)
    }

    fn keys(&self) -> (u64, u64) {
        (
            LittleEndian::read_u64(&self.0[0..8]),
            LittleEndian::read_u64(&self.0[8..16]),
        )
    }
}

// Fill the seed lanes from a counter; Steele et al., "Fast splittable
// pseudorandom number generators".
fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl State {
    const SIP_C: usize = 1;
    const SIP_D: usize = 2;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

fn hash64(seed: &Seed, bytes: &[u8]) -> u64 {
    let (k0, k1) = seed.keys();
    let mut state = State::init(k0, k1);

    let mut rest = bytes;
    while rest.len() >= 8 {
        state.absorb(LittleEndian::read_u64(rest));
        rest = &rest[8..];
    }

    // Final word: remaining bytes, little-endian, length in the top byte.
    let mut tail = [0u8; 8];
    tail[..rest.len()].copy_from_slice(rest);
    tail[7] = bytes.len() as u8;
    state.absorb(LittleEndian::read_u64(&tail));

    state.finalize()
}

/// Hash a key, folded to 32 bits and kept clear of the sentinel.
pub fn hash_bytes(seed: &Seed, bytes: &[u8]) -> u32 {
    let folded = {
        let h = hash64(seed, bytes);
        (h ^ (h >> 32)) as u32
    };
    if folded == EMPTY_HASH {
        0
    } else {
        folded
    }
}

/// Hash a packed batch of fixed-size keys in one pass.
///
/// `keys` holds `out.len()` keys of `key_size` bytes each, back to back.
/// This is the first fused pass of the lookup streamer.
pub fn hash_lanes(seed: &Seed, keys: &[u8], key_size: usize, out: &mut [u32]) {
    debug_assert_eq!(keys.len(), key_size * out.len());
    for (lane, slot) in out.iter_mut().enumerate() {
        *slot = hash_bytes(seed, &keys[lane * key_size..(lane + 1) * key_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Seed {
        Seed::deterministic(42, 0)
    }

    #[test]
    fn stable_and_keyed() {
        let a = hash_bytes(&seed(), b"\x01\x02\x03\x04");
        let b = hash_bytes(&seed(), b"\x01\x02\x03\x04");
        assert_eq!(a, b);

        let other = hash_bytes(&Seed::deterministic(42, 1), b"\x01\x02\x03\x04");
        assert_ne!(a, other);
    }

    #[test]
    fn length_is_hashed() {
        // A short key and its zero-padded extension must differ.
        let a = hash_bytes(&seed(), b"\x01\x02");
        let b = hash_bytes(&seed(), b"\x01\x02\x00\x00");
        assert_ne!(a, b);
    }

    #[test]
    fn never_the_sentinel() {
        let s = seed();
        for i in 0u32..100_000 {
            assert_ne!(hash_bytes(&s, &i.to_le_bytes()), EMPTY_HASH);
        }
    }

    #[test]
    fn lanes_match_pointwise() {
        let s = seed();
        let mut packed = Vec::new();
        for i in 0u32..32 {
            packed.extend_from_slice(&i.to_le_bytes());
        }
        let mut lanes = [0u32; 32];
        hash_lanes(&s, &packed, 4, &mut lanes);
        for i in 0u32..32 {
            assert_eq!(lanes[i as usize], hash_bytes(&s, &i.to_le_bytes()));
        }
    }

    #[test]
    fn deterministic_sequence() {
        assert_eq!(Seed::deterministic(7, 3), Seed::deterministic(7, 3));
        assert_ne!(Seed::deterministic(7, 3), Seed::deterministic(7, 4));
        assert_ne!(Seed::deterministic(8, 3), Seed::deterministic(7, 3));
    }
}
