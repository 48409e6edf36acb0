//! Routing-key → shard assignment.
//!
//! Keys are hashed with xxHash3-64 over their UTF-8 bytes and assigned by
//! modulo over the index's shard count, so a key always lands on the same
//! shard for as long as the shard count is unchanged.

use shardwise_common::types::ShardId;
use xxhash_rust::xxh3::xxh3_64;

/// Hash of a routing key.
pub fn routing_hash(key: &str) -> u64 {
    xxh3_64(key.as_bytes())
}

/// Shard a routing key maps to, or `None` for an index with no shards.
pub fn route_shard(key: &str, number_of_shards: u32) -> Option<ShardId> {
    if number_of_shards == 0 {
        return None;
    }
    Some(ShardId((routing_hash(key) % u64::from(number_of_shards)) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_stable() {
        let a = route_shard("acme", 8).unwrap();
        let b = route_shard("acme", 8).unwrap();
        assert_eq!(a, b);
        assert!(a.0 < 8);
    }

    #[test]
    fn test_route_zero_shards() {
        assert_eq!(route_shard("acme", 0), None);
    }

    #[test]
    fn test_single_shard_always_zero() {
        for key in ["a", "b", "tenant-42", ""] {
            assert_eq!(route_shard(key, 1), Some(ShardId(0)));
        }
    }

    #[test]
    fn test_keys_spread_across_shards() {
        let hit: std::collections::BTreeSet<u32> = (0..200)
            .filter_map(|i| route_shard(&format!("tenant-{}", i), 4))
            .map(|s| s.0)
            .collect();
        assert_eq!(hit.len(), 4);
    }
}
