//! Storage Shard Routing
//!
//! Maps a tree identifier to one of N physical storage shards. The
//! routing function is part of the on-disk contract: every row of a tree
//! must land on the shard this function names, across process restarts
//! and across implementations reading the same store. For that reason it
//! hashes the tree id's canonical hyphenated string form, not its raw
//! bytes, and must never change.

use uuid::Uuid;

/// FNV-1a offset basis (64 bit)
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64 bit)
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Route a tree to its storage shard.
///
/// Pure and deterministic; `total_shards` must be at least 1.
pub fn route(tree_id: Uuid, total_shards: u32) -> u32 {
    debug_assert!(total_shards > 0, "total_shards must be at least 1");

    let mut hash = FNV_OFFSET;
    let mut buf = Uuid::encode_buffer();
    for &b in tree_id.hyphenated().encode_lower(&mut buf).as_bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    (hash % total_shards as u64) as u32
}
