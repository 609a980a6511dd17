//! Shared models and storage traits for the chaingraph delta updater.
//!
//! The crate is split into [`models`] (raw and transformed row shapes plus
//! the delta algebra that folds per-transaction changes into batch-scoped
//! accumulators) and [`storage`] (the gateway traits implemented by
//! `chaingraph-storage`).

pub mod models;
pub mod storage;

/// Canonical binary representation of an address.
pub type Address = Vec<u8>;

/// Dense, monotone identifier assigned to an address on first sighting.
pub type AddressId = i32;

/// Dense, monotone identifier assigned to a UTXO cluster.
pub type ClusterId = i32;

/// Dense transaction identifier, assigned in `(block, within-block)` order.
pub type TxId = i64;

/// Block height.
pub type BlockId = i64;

/// Partition key for an id: integer division by the configured bucket size.
pub fn id_group(id: i64, bucket_size: i64) -> i64 {
    debug_assert!(bucket_size > 0);
    id / bucket_size
}

/// Secondary partition shard used to widen hot partitions.
///
/// Stable across processes and releases, so readers and writers agree on
/// the shard of a row without coordination.
pub fn secondary_group(id: i64, shards: i32) -> i32 {
    if shards <= 1 {
        return 0;
    }
    (fnv1a_64(&id.to_be_bytes()) % shards as u64) as i32
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// The textual partitioning prefix of an address.
///
/// Addresses are partitioned by the first `len` characters of their textual
/// form; binary-only representations fall back to hex encoding.
pub fn address_prefix(encoded: &str, len: usize) -> String {
    encoded.chars().take(len).collect()
}

/// Hex form used for display and prefix computation of binary addresses.
pub fn address_hex(address: &[u8]) -> String {
    hex::encode(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_groups_are_integer_division() {
        assert_eq!(id_group(0, 10_000), 0);
        assert_eq!(id_group(9_999, 10_000), 0);
        assert_eq!(id_group(10_000, 10_000), 1);
        assert_eq!(id_group(25_000, 10_000), 2);
    }

    #[test]
    fn secondary_groups_are_stable_and_bounded() {
        for id in 0..1_000i64 {
            let g = secondary_group(id, 7);
            assert!((0..7).contains(&g));
            assert_eq!(g, secondary_group(id, 7));
        }
        assert_eq!(secondary_group(42, 1), 0);
        assert_eq!(secondary_group(42, 0), 0);
    }

    #[test]
    fn prefixes_truncate_textual_form() {
        assert_eq!(address_prefix("bc1qxyz", 5), "bc1qx");
        assert_eq!(address_prefix("abc", 5), "abc");
    }
}
