//! Key and value codecs for the index structures.
//!
//! Index pages store fixed-width entries, so keys and values must encode to
//! a known number of bytes. Comparisons always happen on decoded values.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

/// A fixed-width, totally ordered index key.
pub trait IndexKey:
    Copy + Ord + Hash + Debug + Default + Send + Sync + 'static
{
    /// Number of bytes this key occupies in a page.
    const ENCODED_SIZE: usize;

    /// Encodes the key into the start of `buf`.
    fn encode_into(&self, buf: &mut [u8]);

    /// Decodes a key from the start of `buf`.
    fn decode_from(buf: &[u8]) -> Self;
}

/// A fixed-width index value.
pub trait IndexValue: Copy + PartialEq + Debug + Send + Sync + 'static {
    /// Number of bytes this value occupies in a page.
    const ENCODED_SIZE: usize;

    /// Encodes the value into the start of `buf`.
    fn encode_into(&self, buf: &mut [u8]);

    /// Decodes a value from the start of `buf`.
    fn decode_from(buf: &[u8]) -> Self;
}

macro_rules! impl_index_key_for_int {
    ($($t:ty),*) => {
        $(
            impl IndexKey for $t {
                const ENCODED_SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn encode_into(&self, buf: &mut [u8]) {
                    buf[..<$t as IndexKey>::ENCODED_SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode_from(buf: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$t>()];
                    bytes.copy_from_slice(&buf[..<$t as IndexKey>::ENCODED_SIZE]);
                    <$t>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_index_key_for_int!(i32, i64, u32, u64);

macro_rules! impl_index_value_for_int {
    ($($t:ty),*) => {
        $(
            impl IndexValue for $t {
                const ENCODED_SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn encode_into(&self, buf: &mut [u8]) {
                    buf[..<$t as IndexValue>::ENCODED_SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode_from(buf: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$t>()];
                    bytes.copy_from_slice(&buf[..<$t as IndexValue>::ENCODED_SIZE]);
                    <$t>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_index_value_for_int!(i32, i64, u32, u64);

/// Hash function over index keys, truncated to 32 bits for extendible
/// hashing.
pub trait KeyHasher<K>: Send + Sync {
    /// Hashes a key down to 32 bits.
    fn hash_key(&self, key: &K) -> u32;
}

/// Default hasher backed by the standard library's SipHash.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyHasher;

impl<K: Hash> KeyHasher<K> for DefaultKeyHasher {
    fn hash_key(&self, key: &K) -> u32 {
        let mut state = DefaultHasher::new();
        key.hash(&mut state);
        state.finish() as u32
    }
}

/// Hasher that uses the low 32 bits of an integer key directly.
///
/// Gives deterministic bucket placement, which makes directory growth and
/// shrinkage reproducible.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityKeyHasher;

impl KeyHasher<i32> for IdentityKeyHasher {
    fn hash_key(&self, key: &i32) -> u32 {
        *key as u32
    }
}

impl KeyHasher<i64> for IdentityKeyHasher {
    fn hash_key(&self, key: &i64) -> u32 {
        *key as u32
    }
}

impl KeyHasher<u32> for IdentityKeyHasher {
    fn hash_key(&self, key: &u32) -> u32 {
        *key
    }
}

impl KeyHasher<u64> for IdentityKeyHasher {
    fn hash_key(&self, key: &u64) -> u32 {
        *key as u32
    }
}
