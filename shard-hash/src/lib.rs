//! Deterministic 64-bit hashing for consistent-hash shard placement.
//!
//! Two algorithms are available: a Murmur3-style hash (the default) and an
//! xxHash-style hash. Both are pure functions of their input bytes with a
//! fixed seed, so ring placement is identical across restarts and across
//! every process in a cluster.

use serde::{Deserialize, Serialize};

/// Maps a byte string to a 64-bit hash.
///
/// Implementations must be deterministic: the same bytes always produce the
/// same `u64`, independent of process or machine. Ring correctness depends
/// only on this determinism; the quality of the distribution affects load
/// balance, not correctness.
pub trait HashFn: Send + Sync + std::fmt::Debug {
    fn hash(&self, key: &[u8]) -> u64;
}

/// Identifies which concrete `HashFn` a cluster has frozen on.
///
/// The chosen algorithm must stay fixed for the lifetime of a cluster;
/// switching it would silently relocate every key on the ring and requires
/// a full reshard instead of a config change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Murmur3,
    XxHash,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Murmur3
    }
}

impl HashAlgorithm {
    pub fn build(self) -> Box<dyn HashFn> {
        match self {
            HashAlgorithm::Murmur3 => Box::new(Murmur3Hash),
            HashAlgorithm::XxHash => Box::new(XxHash64),
        }
    }
}

/// Murmur3 x64-128, folded to the low 64 bits, fixed seed 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct Murmur3Hash;

impl HashFn for Murmur3Hash {
    fn hash(&self, key: &[u8]) -> u64 {
        murmur3_x64_128(key, 0).0
    }
}

/// xxHash64, fixed seed 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct XxHash64;

impl HashFn for XxHash64 {
    fn hash(&self, key: &[u8]) -> u64 {
        xxhash64(key, 0)
    }
}

fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1: u64 = seed;
    let mut h2: u64 = seed;

    let len = data.len();
    let nblocks = len / 16;

    for i in 0..nblocks {
        let block = &data[i * 16..i * 16 + 16];
        let mut k1 = u64::from_le_bytes(block[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(block[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27).wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31).wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;

    if tail.len() > 8 {
        for i in (8..tail.len()).rev() {
            k2 ^= (tail[i] as u64) << ((i - 8) * 8);
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        let n = tail.len().min(8);
        for i in (0..n).rev() {
            k1 ^= (tail[i] as u64) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

const PRIME64_1: u64 = 0x9E37_79B1_85EB_CA87;
const PRIME64_2: u64 = 0xC2B2_AE3D_27D4_EB4F;
const PRIME64_3: u64 = 0x1656_67B1_9E37_79F9;
const PRIME64_4: u64 = 0x85EB_CA77_C2B2_AE63;
const PRIME64_5: u64 = 0x27D4_EB2F_1656_67C5;

fn xxhash64(data: &[u8], seed: u64) -> u64 {
    let len = data.len() as u64;
    let mut pos = 0usize;
    let mut h64;

    if data.len() >= 32 {
        let mut v1 = seed.wrapping_add(PRIME64_1).wrapping_add(PRIME64_2);
        let mut v2 = seed.wrapping_add(PRIME64_2);
        let mut v3 = seed;
        let mut v4 = seed.wrapping_sub(PRIME64_1);

        while pos + 32 <= data.len() {
            v1 = round64(v1, read_u64(data, pos));
            v2 = round64(v2, read_u64(data, pos + 8));
            v3 = round64(v3, read_u64(data, pos + 16));
            v4 = round64(v4, read_u64(data, pos + 24));
            pos += 32;
        }

        h64 = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));

        h64 = merge_round(h64, v1);
        h64 = merge_round(h64, v2);
        h64 = merge_round(h64, v3);
        h64 = merge_round(h64, v4);
    } else {
        h64 = seed.wrapping_add(PRIME64_5);
    }

    h64 = h64.wrapping_add(len);

    while pos + 8 <= data.len() {
        let k1 = round64(0, read_u64(data, pos));
        h64 ^= k1;
        h64 = h64.rotate_left(27).wrapping_mul(PRIME64_1).wrapping_add(PRIME64_4);
        pos += 8;
    }

    if pos + 4 <= data.len() {
        let v = read_u32(data, pos) as u64;
        h64 ^= v.wrapping_mul(PRIME64_1);
        h64 = h64.rotate_left(23).wrapping_mul(PRIME64_2).wrapping_add(PRIME64_3);
        pos += 4;
    }

    while pos < data.len() {
        h64 ^= (data[pos] as u64).wrapping_mul(PRIME64_5);
        h64 = h64.rotate_left(11).wrapping_mul(PRIME64_1);
        pos += 1;
    }

    h64 ^= h64 >> 33;
    h64 = h64.wrapping_mul(PRIME64_2);
    h64 ^= h64 >> 29;
    h64 = h64.wrapping_mul(PRIME64_3);
    h64 ^= h64 >> 32;

    h64
}

fn round64(acc: u64, input: u64) -> u64 {
    let acc = acc.wrapping_add(input.wrapping_mul(PRIME64_2));
    acc.rotate_left(31).wrapping_mul(PRIME64_1)
}

fn merge_round(acc: u64, val: u64) -> u64 {
    let acc = acc ^ round64(0, val);
    acc.wrapping_mul(PRIME64_1).wrapping_add(PRIME64_4)
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap())
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_is_deterministic() {
        let h = Murmur3Hash;
        assert_eq!(h.hash(b"shard-a|0"), h.hash(b"shard-a|0"));
    }

    #[test]
    fn xxhash_is_deterministic() {
        let h = XxHash64;
        assert_eq!(h.hash(b"shard-a|0"), h.hash(b"shard-a|0"));
    }

    #[test]
    fn different_keys_differ() {
        let h = Murmur3Hash;
        assert_ne!(h.hash(b"shard-a|0"), h.hash(b"shard-b|0"));
    }

    #[test]
    fn empty_input_does_not_panic() {
        assert_eq!(Murmur3Hash.hash(b""), Murmur3Hash.hash(b""));
        assert_eq!(XxHash64.hash(b""), XxHash64.hash(b""));
    }

    #[test]
    fn long_input_crosses_block_boundary() {
        let data = vec![7u8; 257];
        assert_eq!(Murmur3Hash.hash(&data), Murmur3Hash.hash(&data));
        assert_eq!(XxHash64.hash(&data), XxHash64.hash(&data));
    }

    #[test]
    fn default_algorithm_is_murmur3() {
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Murmur3);
    }

    proptest::proptest! {
        #[test]
        fn murmur3_deterministic_prop(s in ".*") {
            let h = Murmur3Hash;
            let a = h.hash(s.as_bytes());
            let b = h.hash(s.as_bytes());
            prop_assert_eq!(a, b);
        }

        #[test]
        fn xxhash_deterministic_prop(s in ".*") {
            let h = XxHash64;
            let a = h.hash(s.as_bytes());
            let b = h.hash(s.as_bytes());
            prop_assert_eq!(a, b);
        }
    }
}
