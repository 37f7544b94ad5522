//! GHOST fork choice: the branch with the heaviest observed subtree wins.
//!
//! Two tips are compared at their lowest common ancestor (the fork point).
//! Each side is weighed by the size of the subtree rooted at the fork point's
//! child on that side, so uncles and side blocks count towards a branch even
//! when they are not on its longest path.

use thiserror::Error;

use super::hash::BlockHash;
use super::tree::{ChainTree, TreeError};

/// Errors that can occur while choosing between two tips
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForkChoiceError {
    #[error("No common ancestor between {0} and {1}")]
    NoCommonAncestor(BlockHash, BlockHash),

    #[error("Block {0} is not part of the validated tree")]
    UnvalidatedBranch(BlockHash),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Outcome of comparing the current tip against a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkDecision {
    /// Tip that should be canonical afterwards
    pub tip: BlockHash,

    /// Lowest common ancestor of both tips
    pub fork_point: BlockHash,

    /// Subtree size on the current tip's side of the fork
    pub current_weight: usize,

    /// Subtree size on the candidate's side of the fork
    pub candidate_weight: usize,

    /// Whether the candidate replaced the current tip
    pub switched: bool,
}

/// Finds the lowest common ancestor of two blocks
///
/// Both walks are bounded by the blocks' heights and end at genesis at the
/// latest; failing to meet is reported rather than assumed away.
pub fn common_ancestor(
    tree: &ChainTree,
    a: &BlockHash,
    b: &BlockHash,
) -> Result<BlockHash, ForkChoiceError> {
    let height_a = tree.height(a).ok_or(TreeError::UnknownBlock(*a))?;
    let height_b = tree.height(b).ok_or(TreeError::UnknownBlock(*b))?;
    let level = height_a.min(height_b);

    let missing = || ForkChoiceError::NoCommonAncestor(*a, *b);
    let mut left = tree.ancestor_at(a, level).ok_or_else(missing)?;
    let mut right = tree.ancestor_at(b, level).ok_or_else(missing)?;

    while left != right {
        left = tree.parent_of(&left).ok_or_else(missing)?;
        right = tree.parent_of(&right).ok_or_else(missing)?;
    }
    Ok(left)
}

/// Weighs `candidate_tip` against `current_tip`
///
/// The candidate wins only with a strictly heavier subtree; ties keep the
/// current tip. A candidate extending the current tip always wins and one
/// that is an ancestor of it never does.
pub fn evaluate(
    tree: &ChainTree,
    current_tip: &BlockHash,
    candidate_tip: &BlockHash,
) -> Result<ForkDecision, ForkChoiceError> {
    ensure_validated(tree, candidate_tip)?;
    if !tree.contains(current_tip) {
        return Err(TreeError::UnknownBlock(*current_tip).into());
    }

    let fork_point = common_ancestor(tree, current_tip, candidate_tip)?;
    let weight_below = |tip: &BlockHash| -> Result<usize, ForkChoiceError> {
        if *tip == fork_point {
            return Ok(0);
        }
        let fork_height = tree
            .height(&fork_point)
            .ok_or(TreeError::UnknownBlock(fork_point))?;
        let branch_root = tree
            .ancestor_at(tip, fork_height + 1)
            .ok_or(TreeError::UnknownBlock(*tip))?;
        Ok(tree.subtree_size(&branch_root)?)
    };

    let current_weight = weight_below(current_tip)?;
    let candidate_weight = weight_below(candidate_tip)?;
    let switched = candidate_weight > current_weight;

    Ok(ForkDecision {
        tip: if switched { *candidate_tip } else { *current_tip },
        fork_point,
        current_weight,
        candidate_weight,
        switched,
    })
}

/// Returns the tip that should be canonical after seeing `candidate_tip`
pub fn select_canonical(
    tree: &ChainTree,
    current_tip: &BlockHash,
    candidate_tip: &BlockHash,
) -> Result<BlockHash, ForkChoiceError> {
    evaluate(tree, current_tip, candidate_tip).map(|decision| decision.tip)
}

/// Only validated blocks enter the tree, so a candidate is adoptable iff its
/// whole path back to genesis is present.
fn ensure_validated(tree: &ChainTree, tip: &BlockHash) -> Result<(), ForkChoiceError> {
    let path = tree
        .path_to_root(tip)
        .map_err(|_| ForkChoiceError::UnvalidatedBranch(*tip))?;
    match path.first() {
        Some(root) if root.hash == tree.genesis() => Ok(()),
        _ => Err(ForkChoiceError::UnvalidatedBranch(*tip)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::StateStore;
    use crate::blockchain::block::{Block, BlockTemplate};

    struct Fixture {
        tree: ChainTree,
        genesis: Block,
    }

    impl Fixture {
        fn new() -> Self {
            let genesis = Block::genesis(0, StateStore::new());
            Fixture {
                tree: ChainTree::new(genesis.clone()).unwrap(),
                genesis,
            }
        }

        fn add(&mut self, parent: &BlockHash, nonce: u64) -> BlockHash {
            let parent = self.tree.get(parent).unwrap().clone();
            let block = BlockTemplate::new(&parent, 0, Vec::new(), StateStore::new()).seal(nonce);
            let hash = block.hash;
            self.tree.insert(block).unwrap();
            hash
        }
    }

    #[test]
    fn test_common_ancestor() {
        let mut f = Fixture::new();
        let g = f.genesis.hash;
        let a1 = f.add(&g, 1);
        let a2 = f.add(&a1, 2);
        let a3 = f.add(&a2, 3);
        let b1 = f.add(&a1, 4);

        assert_eq!(common_ancestor(&f.tree, &a3, &b1), Ok(a1));
        assert_eq!(common_ancestor(&f.tree, &a3, &a2), Ok(a2));
        assert_eq!(common_ancestor(&f.tree, &g, &b1), Ok(g));
        assert_eq!(common_ancestor(&f.tree, &b1, &b1), Ok(b1));

        let unknown = g.with_bit_flipped(1);
        assert_eq!(
            common_ancestor(&f.tree, &unknown, &b1),
            Err(ForkChoiceError::Tree(TreeError::UnknownBlock(unknown)))
        );
    }

    #[test]
    fn test_heavier_subtree_beats_longer_chain() {
        let mut f = Fixture::new();
        let g = f.genesis.hash;
        let a1 = f.add(&g, 1);
        let a2 = f.add(&a1, 2);
        let a3 = f.add(&a2, 3);
        let b1 = f.add(&g, 10);
        let b2 = f.add(&b1, 11);
        let b3 = f.add(&b1, 12);
        let b4 = f.add(&b1, 13);

        // Branch a is longer (3 deep) but branch b holds 4 blocks
        let decision = evaluate(&f.tree, &a3, &b4).unwrap();
        assert_eq!(decision.fork_point, g);
        assert_eq!(decision.current_weight, 3);
        assert_eq!(decision.candidate_weight, 4);
        assert!(decision.switched);
        assert_eq!(decision.tip, b4);

        assert_eq!(select_canonical(&f.tree, &b2, &a3), Ok(b2));
        assert_eq!(select_canonical(&f.tree, &b3, &b2), Ok(b3));
    }

    #[test]
    fn test_tie_keeps_current_tip() {
        let mut f = Fixture::new();
        let g = f.genesis.hash;
        let a1 = f.add(&g, 1);
        let b1 = f.add(&g, 2);

        assert_eq!(select_canonical(&f.tree, &a1, &b1), Ok(a1));
        assert_eq!(select_canonical(&f.tree, &b1, &a1), Ok(b1));
    }

    #[test]
    fn test_extension_and_ancestor_candidates() {
        let mut f = Fixture::new();
        let g = f.genesis.hash;
        let a1 = f.add(&g, 1);
        let a2 = f.add(&a1, 2);

        let decision = evaluate(&f.tree, &a1, &a2).unwrap();
        assert!(decision.switched);
        assert_eq!(decision.current_weight, 0);
        assert_eq!(decision.candidate_weight, 1);

        assert_eq!(select_canonical(&f.tree, &a2, &a1), Ok(a2));
        assert_eq!(select_canonical(&f.tree, &a2, &a2), Ok(a2));
        assert_eq!(select_canonical(&f.tree, &g, &a2), Ok(a2));
    }

    #[test]
    fn test_refuses_unvalidated_candidate() {
        let f = Fixture::new();
        let outsider = BlockTemplate::new(&f.genesis, 0, Vec::new(), StateStore::new()).seal(77);

        assert_eq!(
            select_canonical(&f.tree, &f.genesis.hash, &outsider.hash),
            Err(ForkChoiceError::UnvalidatedBranch(outsider.hash))
        );
    }
}
