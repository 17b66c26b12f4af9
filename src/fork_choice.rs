//! Montana fork choice rule
//!
//! Canonical tip = highest cumulative-weight slice that passes validation;
//! ties broken by lower slice hash. Reorgs are bounded: they cannot cross a
//! FINAL slice, must clear a slashing-threshold margin over the current tip,
//! and any equivocating signer observed along the way is slashed.

use crate::types::{Hash, PublicKey};
use std::collections::{HashMap, HashSet};

/// One known chain head (tip candidate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub hash: Hash,
    pub parent_hash: Hash,
    pub height: u64,
    pub tau2_index: u64,
    pub cumulative_weight: u64,
}

impl ChainHead {
    /// Genesis head — its own parent, height 0.
    pub fn genesis(genesis_hash: Hash) -> Self {
        Self {
            hash: genesis_hash,
            parent_hash: genesis_hash,
            height: 0,
            tau2_index: 0,
            cumulative_weight: 0,
        }
    }

    pub fn from_slice_header(
        hash: Hash,
        parent_hash: Hash,
        height: u64,
        tau2_index: u64,
        cumulative_weight: u64,
    ) -> Self {
        Self { hash, parent_hash, height, tau2_index, cumulative_weight }
    }
}

#[derive(Debug)]
pub struct ForkChoice {
    heads: HashMap<Hash, ChainHead>,
    canonical: Hash,
    genesis_hash: Hash,
    finalized_checkpoint: Option<Hash>,
    finalized_height: u64,
    max_reorg_depth: u32,
    /// Signers observed equivocating; weight-zeroed for the quarantine window
    /// elsewhere (`weight::IntegrityRecord`) — this set is fork choice's own
    /// record of who triggered a slash during a reorg.
    slash_set: HashSet<PublicKey>,
}

#[derive(Debug, PartialEq)]
pub enum ChainComparison {
    First,
    Second,
    Equal,
}

#[derive(Debug)]
pub struct ReorgResult {
    pub orphaned: Vec<Hash>,
    pub adopted: Vec<Hash>,
    pub depth: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ForkChoiceError {
    #[error("reorg too deep: attempted={attempted}, max={max}")]
    ReorgTooDeep { attempted: u32, max: u32 },
    #[error("reorg would cross a finalized slice")]
    ReorgBelowFinalized,
    #[error("new branch weight does not clear the slashing threshold")]
    InsufficientWeight,
    #[error("head not found")]
    HeadNotFound,
    #[error("no common ancestor (disjoint chains)")]
    NoCommonAncestor,
}

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximum reorg depth before a FINAL boundary would be crossed (§4.4): one τ₃.
pub const MAX_REORG_DEPTH: u32 = crate::types::COOLDOWN_WINDOW_TAU2 as u32;

/// After this many descendant slices a chain is SAFE: reorging past it
/// requires an alternate branch with ≥6x the current slice's own weight.
pub const SAFE_DEPTH: u32 = 6;

impl ForkChoice {
    pub fn new(genesis_hash: Hash) -> Self {
        let genesis_head = ChainHead::genesis(genesis_hash);
        let mut heads = HashMap::new();
        heads.insert(genesis_hash, genesis_head);

        Self {
            heads,
            canonical: genesis_hash,
            genesis_hash,
            finalized_checkpoint: None,
            finalized_height: 0,
            max_reorg_depth: MAX_REORG_DEPTH,
            slash_set: HashSet::new(),
        }
    }

    pub fn add_head(&mut self, head: ChainHead) -> Result<(), ForkChoiceError> {
        self.heads.insert(head.hash, head);
        Ok(())
    }

    pub fn canonical_head(&self) -> &ChainHead {
        self.heads.get(&self.canonical).expect("canonical head must exist")
    }

    pub fn is_slashed(&self, pubkey: &PublicKey) -> bool {
        self.slash_set.contains(pubkey)
    }

    /// Compare two chain heads: cumulative-weight primary, lower hash tiebreak.
    pub fn compare(&self, a: &ChainHead, b: &ChainHead) -> ChainComparison {
        match a.cumulative_weight.cmp(&b.cumulative_weight) {
            std::cmp::Ordering::Greater => return ChainComparison::First,
            std::cmp::Ordering::Less => return ChainComparison::Second,
            std::cmp::Ordering::Equal => {}
        }

        match a.hash.cmp(&b.hash) {
            std::cmp::Ordering::Less => ChainComparison::First,
            std::cmp::Ordering::Greater => ChainComparison::Second,
            std::cmp::Ordering::Equal => ChainComparison::Equal,
        }
    }

    pub fn should_reorg(&self, new_head: &ChainHead) -> bool {
        let current = self.canonical_head();
        matches!(self.compare(current, new_head), ChainComparison::Second)
    }

    /// Walk both chains back to their first shared ancestor.
    fn find_common_ancestor(&self, a: &Hash, b: &Hash) -> Result<ChainHead, ForkChoiceError> {
        let mut seen: HashSet<Hash> = HashSet::new();
        let mut cursor = *a;
        loop {
            seen.insert(cursor);
            if cursor == self.genesis_hash {
                break;
            }
            let head = self.heads.get(&cursor).ok_or(ForkChoiceError::HeadNotFound)?;
            if head.parent_hash == cursor {
                break; // genesis-like self-parent
            }
            cursor = head.parent_hash;
        }

        let mut cursor = *b;
        loop {
            if seen.contains(&cursor) {
                return self.heads.get(&cursor).cloned().ok_or(ForkChoiceError::HeadNotFound);
            }
            if cursor == self.genesis_hash {
                return self.heads.get(&self.genesis_hash).cloned().ok_or(ForkChoiceError::HeadNotFound);
            }
            let head = self.heads.get(&cursor).ok_or(ForkChoiceError::NoCommonAncestor)?;
            if head.parent_hash == cursor {
                return Err(ForkChoiceError::NoCommonAncestor);
            }
            cursor = head.parent_hash;
        }
    }

    /// Hashes strictly between `from` and `ancestor` (exclusive of ancestor), walking parents.
    fn walk_to_ancestor(&self, from: &Hash, ancestor: &Hash) -> Vec<Hash> {
        let mut path = Vec::new();
        let mut cursor = *from;
        while &cursor != ancestor {
            path.push(cursor);
            let Some(head) = self.heads.get(&cursor) else { break };
            if head.parent_hash == cursor {
                break;
            }
            cursor = head.parent_hash;
        }
        path
    }

    fn compute_orphaned(&self, from: &Hash, ancestor: &Hash) -> Vec<Hash> {
        self.walk_to_ancestor(from, ancestor)
    }

    fn compute_adopted(&self, from: &Hash, ancestor: &Hash) -> Vec<Hash> {
        self.walk_to_ancestor(from, ancestor)
    }

    /// Slashing-threshold margin the new branch must clear over the current tip.
    fn slashing_threshold(current_tip_weight: u64, parent_weight: u64) -> u64 {
        let margin = (current_tip_weight / 10).saturating_sub(parent_weight);
        margin.max(1)
    }

    /// Attempt a reorg onto `new_head`. `equivocators` are signers discovered
    /// (by the caller, via duplicate-signature detection) to have signed two
    /// distinct artifacts for the same τ₂-index along either branch.
    pub fn reorg_to(
        &mut self,
        new_head: ChainHead,
        equivocators: &[PublicKey],
    ) -> Result<ReorgResult, ForkChoiceError> {
        let current = self.canonical_head().clone();

        self.heads.entry(new_head.hash).or_insert_with(|| new_head.clone());

        let common_ancestor = self.find_common_ancestor(&current.hash, &new_head.hash)?;
        let reorg_depth = current.height.saturating_sub(common_ancestor.height);

        if reorg_depth > self.max_reorg_depth as u64 {
            return Err(ForkChoiceError::ReorgTooDeep {
                attempted: reorg_depth as u32,
                max: self.max_reorg_depth,
            });
        }

        if common_ancestor.height < self.finalized_height {
            return Err(ForkChoiceError::ReorgBelowFinalized);
        }

        let threshold = Self::slashing_threshold(current.cumulative_weight, common_ancestor.cumulative_weight);
        if new_head.cumulative_weight < current.cumulative_weight.saturating_add(threshold) {
            return Err(ForkChoiceError::InsufficientWeight);
        }

        let orphaned = self.compute_orphaned(&current.hash, &common_ancestor.hash);
        let adopted = self.compute_adopted(&new_head.hash, &common_ancestor.hash);

        self.canonical = new_head.hash;
        for pubkey in equivocators {
            self.slash_set.insert(pubkey.clone());
        }

        Ok(ReorgResult { orphaned, adopted, depth: reorg_depth as u32 })
    }

    pub fn set_finalized(&mut self, checkpoint_hash: Hash, height: u64) {
        self.finalized_checkpoint = Some(checkpoint_hash);
        self.finalized_height = height;
    }

    pub fn can_reorg_to(&self, target_hash: &Hash) -> bool {
        let Some(target) = self.heads.get(target_hash) else {
            return false;
        };
        let current = self.canonical_head();
        let Ok(common_ancestor) = self.find_common_ancestor(&current.hash, &target.hash) else {
            return false;
        };
        let reorg_depth = current.height.saturating_sub(common_ancestor.height);
        reorg_depth <= self.max_reorg_depth as u64 && common_ancestor.height >= self.finalized_height
    }

    #[cfg(test)]
    pub fn get_head(&self, hash: &Hash) -> Option<&ChainHead> {
        self.heads.get(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(hash: Hash, parent: Hash, height: u64, weight: u64) -> ChainHead {
        ChainHead::from_slice_header(hash, parent, height, height, weight)
    }

    #[test]
    fn heavier_chain_wins_regardless_of_height() {
        let fork_choice = ForkChoice::new([0u8; 32]);

        let tall_but_light = head([1u8; 32], [0u8; 32], 10, 50);
        let short_but_heavy = head([2u8; 32], [0u8; 32], 3, 100);

        assert_eq!(fork_choice.compare(&tall_but_light, &short_but_heavy), ChainComparison::Second);
        assert_eq!(fork_choice.compare(&short_but_heavy, &tall_but_light), ChainComparison::First);
    }

    #[test]
    fn smaller_hash_wins_at_equal_weight() {
        let fork_choice = ForkChoice::new([0u8; 32]);

        let big_hash = head([2u8; 32], [0u8; 32], 10, 100);
        let small_hash = head([1u8; 32], [0u8; 32], 10, 100);

        assert_eq!(fork_choice.compare(&big_hash, &small_hash), ChainComparison::Second);
        assert_eq!(fork_choice.compare(&small_hash, &big_hash), ChainComparison::First);
    }

    #[test]
    fn equal_chains_compare_equal() {
        let fork_choice = ForkChoice::new([0u8; 32]);
        let a = head([1u8; 32], [0u8; 32], 10, 100);
        let b = head([1u8; 32], [0u8; 32], 10, 100);
        assert_eq!(fork_choice.compare(&a, &b), ChainComparison::Equal);
    }

    #[test]
    fn reorg_too_deep_is_rejected() {
        let mut fork_choice = ForkChoice::new([0u8; 32]);
        fork_choice.max_reorg_depth = 5;

        let current = head([1u8; 32], [0u8; 32], 10, 100);
        let new_head = head([2u8; 32], [0u8; 32], 20, 1000);

        fork_choice.heads.insert(current.hash, current);
        fork_choice.canonical = [1u8; 32];

        assert!(matches!(
            fork_choice.reorg_to(new_head, &[]),
            Err(ForkChoiceError::ReorgTooDeep { .. })
        ));
    }

    #[test]
    fn reorg_below_finalized_is_rejected() {
        let mut fork_choice = ForkChoice::new([0u8; 32]);
        fork_choice.set_finalized([1u8; 32], 100);

        let finalized_head = head([1u8; 32], [0u8; 32], 100, 100);
        let new_head = head([2u8; 32], [0u8; 32], 200, 1000);

        fork_choice.heads.insert(finalized_head.hash, finalized_head);
        fork_choice.canonical = [1u8; 32];

        assert!(matches!(
            fork_choice.reorg_to(new_head, &[]),
            Err(ForkChoiceError::ReorgBelowFinalized)
        ));
    }

    #[test]
    fn reorg_below_slashing_threshold_is_rejected() {
        let mut fork_choice = ForkChoice::new([0u8; 32]);

        let current = head([1u8; 32], [0u8; 32], 10, 1000);
        // 0.1 * 1000 - 0 = 100 margin required; this head only exceeds by 1.
        let new_head = head([2u8; 32], [0u8; 32], 10, 1000 + 1);

        fork_choice.heads.insert(current.hash, current);
        fork_choice.canonical = [1u8; 32];

        assert!(matches!(
            fork_choice.reorg_to(new_head, &[]),
            Err(ForkChoiceError::InsufficientWeight)
        ));
    }

    #[test]
    fn successful_reorg_adopts_new_canonical_head_and_slashes_equivocators() {
        let mut fork_choice = ForkChoice::new([0u8; 32]);

        let current = head([1u8; 32], [0u8; 32], 10, 50);
        fork_choice.heads.insert(current.hash, current);
        fork_choice.canonical = [1u8; 32];

        let new_head = head([2u8; 32], [0u8; 32], 15, 200);
        assert!(fork_choice.should_reorg(&new_head));

        let equivocator: PublicKey = vec![9u8; 32];
        let result = fork_choice.reorg_to(new_head, &[equivocator.clone()]).unwrap();

        assert_eq!(fork_choice.canonical, [2u8; 32]);
        assert_eq!(result.depth, 10);
        assert!(fork_choice.is_slashed(&equivocator));
    }

    #[test]
    fn canonical_head_starts_at_genesis() {
        let fork_choice = ForkChoice::new([0u8; 32]);
        let genesis = fork_choice.canonical_head();
        assert_eq!(genesis.hash, [0u8; 32]);
        assert_eq!(genesis.height, 0);
    }
}
