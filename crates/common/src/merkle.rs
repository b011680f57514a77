//! # Output Merkle Commitments
//!
//! Binary Merkle tree over machine emissions, used for two commitments:
//!
//! 1. **Per-input outputs hash** — the root over the Keccak-256 hashes of
//!    every output emitted while processing one input.
//! 2. **Epoch claim** — the root over the per-input outputs hashes of every
//!    input accepted in the epoch (see [`crate::claim`]).
//!
//! ## Construction
//!
//! - Empty leaf set commits to the all-zero hash.
//! - Leaves are Keccak-256 digests (raw emissions are hashed first).
//! - A layer with an odd node count duplicates its last node.
//! - Parents are `keccak256(left || right)` over the two child digests.
//!
//! The construction is position dependent: reordering leaves changes the
//! root, which is what makes the claim a commitment to emission order.

use crate::types::Hash32;

/// Computes the Merkle root of a list of digests.
///
/// Returns [`Hash32::ZERO`] for an empty list.
pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return Hash32::ZERO;
    }

    let mut layer: Vec<Hash32> = leaves.to_vec();

    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            // Odd layer: duplicate the last node so every node has a sibling.
            let last = *layer.last().unwrap_or(&Hash32::ZERO);
            layer.push(last);
        }

        layer = layer
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    layer[0]
}

/// Computes the outputs hash for one processed input: each raw emission is
/// hashed with Keccak-256 and the digests are rooted with [`merkle_root`].
pub fn outputs_merkle(outputs: &[Vec<u8>]) -> Hash32 {
    let leaves: Vec<Hash32> = outputs.iter().map(|o| Hash32::digest(o)).collect();
    merkle_root(&leaves)
}

/// Hashes a parent node from two children: `keccak256(left || right)`.
fn hash_pair(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    Hash32::digest(&buf)
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_leaves_commit_to_zero() {
        assert_eq!(merkle_root(&[]), Hash32::ZERO);
        assert_eq!(outputs_merkle(&[]), Hash32::ZERO);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = Hash32::digest(b"only");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn two_leaves_hash_pairwise() {
        let a = Hash32::digest(b"a");
        let b = Hash32::digest(b"b");
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(a.as_bytes());
        buf[32..].copy_from_slice(b.as_bytes());
        assert_eq!(merkle_root(&[a, b]), Hash32::digest(&buf));
    }

    #[test]
    fn odd_layer_duplicates_last_leaf() {
        let a = Hash32::digest(b"a");
        let b = Hash32::digest(b"b");
        let c = Hash32::digest(b"c");
        // Three leaves root exactly like four with the last duplicated.
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c, c]));
    }

    #[test]
    fn root_is_deterministic() {
        let leaves: Vec<Hash32> = (0u8..7).map(|i| Hash32::digest(&[i])).collect();
        let first = merkle_root(&leaves);
        for _ in 0..100 {
            assert_eq!(merkle_root(&leaves), first);
        }
    }

    #[test]
    fn leaf_order_changes_root() {
        let a = Hash32::digest(b"a");
        let b = Hash32::digest(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn outputs_merkle_hashes_raw_emissions() {
        let out = vec![b"notice-payload".to_vec()];
        assert_eq!(outputs_merkle(&out), Hash32::digest(b"notice-payload"));
    }
}
