//! Node hash functions.
//!
//! Leaf and internal hashes are domain-separated by a one-byte prefix so a
//! leaf can never collide with an internal node at the same path:
//!
//! ```text
//! leaf     = blake3(0x00 || u32le(key.len()) || key || value)
//! internal = blake3(0x01 || left || right)
//! ```
//!
//! A missing child (the root of a tree holding zero or one leaf) contributes
//! [`Hash::ZERO`].

use crate::Hash;

const LEAF_DOMAIN: u8 = 0x00;
const INTERNAL_DOMAIN: u8 = 0x01;

/// Hash of a leaf holding `key` and `value`.
pub fn hash_leaf(key: &[u8], value: &[u8]) -> Hash {
    let key_len = (key.len() as u32).to_le_bytes();
    Hash::from_parts(&[&[LEAF_DOMAIN], &key_len, key, value])
}

/// Hash two child nodes to produce the parent hash.
#[inline]
pub fn hash_internal(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 65];
    data[0] = INTERNAL_DOMAIN;
    data[1..33].copy_from_slice(left.as_bytes());
    data[33..].copy_from_slice(right.as_bytes());
    Hash::from_bytes(&data)
}

/// Root hash of a tree with no leaves.
pub fn empty_root_hash() -> Hash {
    hash_internal(&Hash::ZERO, &Hash::ZERO)
}
