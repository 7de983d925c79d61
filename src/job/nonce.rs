//! Candidate nonce validation.
//!
//! A returned nonce is judged by rebuilding the full 80-byte header,
//! double-hashing it, and dividing the difficulty-1 reference by the hash
//! read as a little-endian 256-bit number. The quotient is the share
//! difficulty: at least the pool difficulty means a submittable share, at
//! least the network difficulty means a block.

use bitcoin::hashes::{sha256d, Hash};

use super::AsicJob;

/// The difficulty-1 reference numerator (65535 * 2^208).
pub const TRUEDIFFONE: f64 =
    26959535291011309493156476344723991336010898738574164086137773096960.0;

/// Read 32 little-endian bytes as an f64 approximation of the 256-bit value.
pub fn le256_to_f64(bytes: &[u8; 32]) -> f64 {
    bytes.iter().rev().fold(0.0, |acc, &b| acc * 256.0 + b as f64)
}

/// Share difficulty achieved by `(rolled_version, ntime, nonce)` on `job`.
///
/// Pure function of its inputs: rebuilds the header, double-SHA-256s it,
/// and returns `TRUEDIFFONE / hash`.
pub fn test_nonce(job: &AsicJob, nonce: u32, rolled_version: u32) -> f64 {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&rolled_version.to_le_bytes());
    header[4..36].copy_from_slice(&job.prev_block_hash);
    header[36..68].copy_from_slice(&job.merkle_root);
    header[68..72].copy_from_slice(&job.ntime.to_le_bytes());
    header[72..76].copy_from_slice(&job.nbits.to_le_bytes());
    header[76..80].copy_from_slice(&nonce.to_le_bytes());

    let hash = sha256d::Hash::hash(&header);
    TRUEDIFFONE / le256_to_f64(hash.as_byte_array())
}
