//! Stable key hashing.
//!
//! Ownership routing and queue partitioning must agree across processes
//! and builds, so they use FNV-1a rather than the randomized std hasher.

const FNV_OFFSET: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// 64-bit FNV-1a over the key bytes. Every node must compute the same
/// owner for a key, so this must not be swapped for `DefaultHasher` or a
/// word-size dependent hasher.
pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash a string key.
pub fn key_hash(key: &str) -> u64 {
    fnv1a64(key.as_bytes())
}
