//! Derive ASIC-ready jobs from pool notifications.
//!
//! The pool hands us a split coinbase and a Merkle path; everything else is
//! local choice. The builder picks an extranonce2, folds the Merkle root,
//! precomputes midstates over the first 64 header bytes, and converts the
//! hashes into the word order the chips want.

use std::sync::Arc;

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use rand::Rng;

use super::AsicJob;
use crate::asic::protocol::hash_wire_order;
use crate::asic::AsicModel;
use crate::stratum_v1::{MiningNotification, SessionParams};

/// Default width of the nonce subrange a job starts in.
pub const DEFAULT_SUBRANGE_SIZE: u32 = 400_000_000;

/// Builds [`AsicJob`]s from notifications and session state.
pub struct JobBuilder {
    model: AsicModel,
    extranonce2_counter: u32,
    subrange_size: u32,
}

impl JobBuilder {
    pub fn new(model: AsicModel) -> Self {
        Self::with_subrange(model, DEFAULT_SUBRANGE_SIZE)
    }

    /// A subrange size of 0 pins every job's starting nonce to 0.
    pub fn with_subrange(model: AsicModel, subrange_size: u32) -> Self {
        Self {
            model,
            extranonce2_counter: 0,
            subrange_size,
        }
    }

    /// Next extranonce2, rendered to the pool's configured width.
    ///
    /// The 32-bit counter occupies the leading bytes little-endian; wider
    /// extranonce2 sizes are zero-padded on the right.
    fn next_extranonce2(&mut self, size: usize) -> Vec<u8> {
        let counter = self.extranonce2_counter;
        self.extranonce2_counter = self.extranonce2_counter.wrapping_add(1);

        let mut out = vec![0u8; size];
        let n = size.min(4);
        out[..n].copy_from_slice(&counter.to_le_bytes()[..n]);
        out
    }

    /// Fresh starting nonce: a random subrange origin, aligned.
    fn starting_nonce(&self) -> u32 {
        if self.subrange_size == 0 {
            return 0;
        }
        let slots = (u32::MAX / self.subrange_size).max(1);
        rand::thread_rng().gen_range(0..slots) * self.subrange_size
    }

    /// Derive one job from a notification under the current session.
    ///
    /// `local_job_id` is left at 0 here; the registry assigns the slot when
    /// the job is installed for dispatch.
    pub fn build(
        &mut self,
        notification: &Arc<MiningNotification>,
        session: &SessionParams,
        epoch: u64,
    ) -> AsicJob {
        let extranonce2 = self.next_extranonce2(session.extranonce2_size);
        let coinbase = build_coinbase(
            &notification.coinbase_1,
            &session.extranonce1,
            &extranonce2,
            &notification.coinbase_2,
        );
        let merkle_root = merkle_root(&coinbase, &notification.merkle_branches);

        let prev_block_hash = notification.prev_block_hash.to_byte_array();
        let version = notification.version.to_consensus() as u32;

        let mut header64 = [0u8; 64];
        header64[0..4].copy_from_slice(&version.to_le_bytes());
        header64[4..36].copy_from_slice(&prev_block_hash);
        header64[36..64].copy_from_slice(&merkle_root[0..28]);

        let num_midstates = self.model.midstates_per_job(session.version_mask != 0);
        let mut midstates = [[0u8; 32]; 4];
        midstates[0] = midstate(&header64);
        let mut rolled = version;
        for slot in midstates.iter_mut().take(num_midstates as usize).skip(1) {
            rolled = increment_bitmask(rolled, session.version_mask);
            header64[0..4].copy_from_slice(&rolled.to_le_bytes());
            *slot = midstate(&header64);
        }

        AsicJob {
            local_job_id: 0,
            starting_nonce: self.starting_nonce(),
            nbits: notification.nbits.to_consensus(),
            ntime: notification.ntime,
            version,
            prev_block_hash,
            merkle_root,
            prev_block_hash_be: hash_wire_order(&prev_block_hash),
            merkle_root_be: hash_wire_order(&merkle_root),
            num_midstates,
            midstates,
            extranonce2,
            version_mask: session.version_mask,
            pool_difficulty: session.pool_difficulty,
            epoch,
            notification: Arc::clone(notification),
        }
    }
}

/// Assemble the coinbase transaction bytes.
///
/// `coinbase_1 || extranonce1 || extranonce2 || coinbase_2`.
pub fn build_coinbase(
    coinbase_1: &[u8],
    extranonce1: &[u8],
    extranonce2: &[u8],
    coinbase_2: &[u8],
) -> Vec<u8> {
    let mut coinbase =
        Vec::with_capacity(coinbase_1.len() + extranonce1.len() + extranonce2.len() + coinbase_2.len());
    coinbase.extend_from_slice(coinbase_1);
    coinbase.extend_from_slice(extranonce1);
    coinbase.extend_from_slice(extranonce2);
    coinbase.extend_from_slice(coinbase_2);
    coinbase
}

/// Fold the coinbase hash through the Merkle path.
pub fn merkle_root(coinbase: &[u8], branches: &[bitcoin::TxMerkleNode]) -> [u8; 32] {
    let mut pair = [0u8; 64];
    let mut root = sha256d::Hash::hash(coinbase).to_byte_array();
    for branch in branches {
        pair[0..32].copy_from_slice(&root);
        pair[32..64].copy_from_slice(&branch.to_byte_array());
        root = sha256d::Hash::hash(&pair).to_byte_array();
    }
    root
}

/// SHA-256 midstate over the first 64 header bytes, in wire byte order.
///
/// The engine state after absorbing exactly one block, with no padding or
/// finalization, byte-reversed the way the chips take it.
pub fn midstate(header64: &[u8; 64]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(header64);
    let mut bytes = engine.midstate().to_byte_array();
    bytes.reverse();
    bytes
}

/// Add one to `value` within `mask`, propagating carries inside the mask.
///
/// Bits outside the mask are preserved unless the masked field overflows,
/// in which case the carry spills into the next higher bit, matching the
/// version-rolling convention.
pub fn increment_bitmask(value: u32, mask: u32) -> u32 {
    if mask == 0 {
        return value;
    }

    let carry = (value & mask).wrapping_add(mask & mask.wrapping_neg());
    let overflow = carry & !mask;
    let new_value = (value & !mask) | (carry & mask);

    if overflow > 0 {
        return increment_bitmask(new_value, overflow << 1);
    }

    new_value
}
