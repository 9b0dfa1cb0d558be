//! Sharder implementation.
//!
//! A sharder maps an arbitrary input to a uniformly distributed integer in `[0, total_shards)`.
//! Experiments bucket units by sharding `"{salt}-{unit_key}"` into [`BUCKET_SPACE`] shards, so that
//! two experiments with different salts place the same unit independently.

/// Size of the bucket space. Traffic allocations are expressed in basis points of this space.
pub const BUCKET_SPACE: u64 = 10_000;

pub trait Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// The default (and only) sharder.
///
/// Uses the first four bytes of the MD5 digest as a big-endian integer. MD5 is not used for any
/// security property here, only for its stable and well-mixed output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as u64) % total_shards
    }
}

/// Compute the bucket of `unit_key` under `salt`.
///
/// `unit_key` is expected to be non-empty; anonymous units are represented by
/// [`ANONYMOUS_UNIT_KEY`](crate::ANONYMOUS_UNIT_KEY).
pub fn bucket(sharder: &impl Sharder, salt: &str, unit_key: &str) -> u64 {
    sharder.get_shard(format!("{salt}-{unit_key}"), BUCKET_SPACE)
}
