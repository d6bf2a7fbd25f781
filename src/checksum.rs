//! Pluggable page checksums. Selected once, at format time, and
//! recorded in the superblock so `open()` can refuse a mismatched algorithm
//! rather than silently trusting bad digests.

/// A checksum algorithm over raw page bytes.
pub trait Checksum: Send + Sync {
    /// Short, stable name recorded in the superblock.
    fn name(&self) -> &str;
    /// Width of the digest returned by [`Checksum::compute`], in bytes.
    fn digest_size(&self) -> usize;
    /// Compute the digest of `bytes`, written into the low `digest_size()`
    /// bytes of the returned vector.
    fn compute(&self, bytes: &[u8]) -> Vec<u8>;
}

/// Default checksum: 64-bit xxHash3.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3Checksum;

impl Checksum for Xxh3Checksum {
    fn name(&self) -> &str {
        "xxh3-64"
    }

    fn digest_size(&self) -> usize {
        8
    }

    fn compute(&self, bytes: &[u8]) -> Vec<u8> {
        xxhash_rust::xxh3::xxh3_64(bytes).to_le_bytes().to_vec()
    }
}
