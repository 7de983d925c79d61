//! Job construction and validation.
//!
//! From each pool notification the builder derives ASIC-ready job records:
//! coinbase assembly, Merkle root folding, midstate precomputation, and the
//! byte-order conversions the chips expect. [`nonce`] holds the pure
//! validation math that turns a returned nonce back into a share difficulty.

pub mod builder;
pub mod nonce;

pub use builder::{increment_bitmask, JobBuilder};
pub use nonce::test_nonce;

use std::sync::Arc;

use crate::stratum_v1::MiningNotification;

/// One unit of work shipped to a chip.
///
/// Carries both hash forms: the hashing-order bytes feed [`test_nonce`],
/// the word-reversed `_be` forms go on the wire. The originating
/// notification rides along behind an `Arc`, so it stays alive exactly as
/// long as some derived job still references it.
#[derive(Debug, Clone)]
pub struct AsicJob {
    /// Registry slot id; multiple of 8 in [0, 128). Assigned at install.
    pub local_job_id: u8,
    pub starting_nonce: u32,
    pub nbits: u32,
    pub ntime: u32,
    /// Base header version, before any rolling.
    pub version: u32,
    /// Previous block hash, hashing order.
    pub prev_block_hash: [u8; 32],
    /// Merkle root, hashing order.
    pub merkle_root: [u8; 32],
    /// Previous block hash, wire order.
    pub prev_block_hash_be: [u8; 32],
    /// Merkle root, wire order.
    pub merkle_root_be: [u8; 32],
    /// 1 without version rolling, 4 with (midstate-format chips).
    pub num_midstates: u8,
    /// Wire-order midstates; the first `num_midstates` entries are valid.
    pub midstates: [[u8; 32]; 4],
    /// Locally chosen extranonce2 for this job.
    pub extranonce2: Vec<u8>,
    /// Version-rolling mask this job was built under; 0 when disabled.
    pub version_mask: u32,
    /// Pool difficulty at dispatch time.
    pub pool_difficulty: f64,
    /// Work-abandonment epoch this job belongs to.
    pub epoch: u64,
    /// The notification this job was derived from.
    pub notification: Arc<MiningNotification>,
}
