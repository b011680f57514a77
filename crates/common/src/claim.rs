//! # Epoch Claims
//!
//! Inputs are grouped into fixed-length epochs by the block number that
//! included them. Once every input of an epoch has been processed, the node
//! commits to the epoch with a single claim hash: the Merkle root over the
//! per-input outputs hashes, in input order.

use serde::{Deserialize, Serialize};

use crate::merkle::merkle_root;
use crate::types::Hash32;

/// Default number of blocks per epoch.
pub const DEFAULT_EPOCH_LENGTH: u64 = 7200;

/// An epoch claim ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub epoch: u64,
    /// Inbox index of the first input covered by the claim.
    pub first_index: u64,
    /// Inbox index of the last input covered by the claim.
    pub last_index: u64,
    pub claim_hash: Hash32,
}

/// Maps a block number to its epoch.
///
/// `epoch_length` must be non-zero; configuration validation enforces this
/// before any claim work runs.
pub fn epoch_of(block_number: u64, epoch_length: u64) -> u64 {
    debug_assert!(epoch_length > 0);
    block_number / epoch_length.max(1)
}

/// True when `block_number` falls in a later epoch than `previous_block`.
pub fn crossed_epoch(previous_block: u64, block_number: u64, epoch_length: u64) -> bool {
    epoch_of(block_number, epoch_length) > epoch_of(previous_block, epoch_length)
}

/// Builds the claim hash from the per-input outputs hashes of an epoch's
/// accepted inputs, in input order. An epoch with no accepted inputs commits
/// to the all-zero hash.
pub fn compute_claim(outputs_hashes: &[Hash32]) -> Hash32 {
    merkle_root(outputs_hashes)
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_boundaries() {
        assert_eq!(epoch_of(0, 7200), 0);
        assert_eq!(epoch_of(7199, 7200), 0);
        assert_eq!(epoch_of(7200, 7200), 1);
        assert_eq!(epoch_of(14_400, 7200), 2);
    }

    #[test]
    fn crossed_epoch_only_on_boundary() {
        assert!(!crossed_epoch(0, 7199, 7200));
        assert!(crossed_epoch(7199, 7200, 7200));
        assert!(!crossed_epoch(7200, 7201, 7200));
        // Several epochs at once still counts as crossed.
        assert!(crossed_epoch(0, 20_000, 7200));
    }

    #[test]
    fn empty_epoch_claims_zero() {
        assert_eq!(compute_claim(&[]), Hash32::ZERO);
    }

    #[test]
    fn claim_depends_on_input_order() {
        let a = Hash32::digest(b"first");
        let b = Hash32::digest(b"second");
        assert_ne!(compute_claim(&[a, b]), compute_claim(&[b, a]));
    }
}
