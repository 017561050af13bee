use crate::types::{EntityId, ShardId};

/// DJB2 over a byte slice. Stable across processes and releases, which is
/// what shard derivation requires.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(5381u32, |hash, &b| hash.wrapping_mul(33).wrapping_add(b as u32))
}

/// 64-bit DJB2 variant, used where a wider spread is wanted (node tags).
pub fn djb2_hash64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(5381u64, |hash, &b| hash.wrapping_mul(33).wrapping_add(b as u64))
}

/// Derive the shard of an entity: `djb2(entity_id) % number_of_shards`.
///
/// The same id always lands on the same shard for a given shard count.
///
/// # Panics
///
/// Panics if `number_of_shards` is zero. `ShardingConfig::validate` rejects
/// that value before any region is built.
pub fn shard_for_entity(entity_id: &EntityId, number_of_shards: u32) -> ShardId {
    assert!(number_of_shards >= 1, "number_of_shards must be >= 1");
    ShardId(djb2_hash(entity_id.0.as_bytes()) % number_of_shards)
}
