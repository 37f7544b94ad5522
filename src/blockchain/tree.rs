//! Arena of every accepted block, linked parent to children by hash.

use thiserror::Error;

use std::collections::{BTreeSet, HashMap};

use super::block::Block;
use super::hash::BlockHash;

/// Errors that can occur during tree operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("Unknown parent block {0}")]
    UnknownParent(BlockHash),

    #[error("Block {0} is already in the tree")]
    Duplicate(BlockHash),

    #[error("Block {0} is not in the tree")]
    UnknownBlock(BlockHash),

    #[error("Block {0} has a parent and cannot be the root")]
    NotARoot(BlockHash),

    #[error("Block {0} has no parent and is not the root")]
    ForeignRoot(BlockHash),
}

/// A block together with its position in the tree
#[derive(Debug, Clone)]
struct TreeNode {
    block: Block,
    /// Distance from genesis
    height: u64,
    children: BTreeSet<BlockHash>,
}

/// Every known block, rooted at genesis
///
/// Blocks are only ever added as leaves under a parent already present, so
/// the structure stays a tree and every walk towards the root ends at genesis.
#[derive(Debug, Clone)]
pub struct ChainTree {
    genesis: BlockHash,
    nodes: HashMap<BlockHash, TreeNode>,
}

impl ChainTree {
    /// Creates a tree holding only `genesis`
    pub fn new(genesis: Block) -> Result<Self, TreeError> {
        if !genesis.is_genesis() {
            return Err(TreeError::NotARoot(genesis.hash));
        }

        let hash = genesis.hash;
        let mut nodes = HashMap::new();
        nodes.insert(
            hash,
            TreeNode {
                block: genesis,
                height: 0,
                children: BTreeSet::new(),
            },
        );

        Ok(ChainTree {
            genesis: hash,
            nodes,
        })
    }

    /// Hash of the root block
    pub fn genesis(&self) -> BlockHash {
        self.genesis
    }

    pub fn genesis_block(&self) -> &Block {
        // The root is inserted at construction and never removed
        &self.nodes[&self.genesis].block
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&Block> {
        self.nodes.get(hash).map(|node| &node.block)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.nodes.contains_key(hash)
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Distance of a block from genesis
    pub fn height(&self, hash: &BlockHash) -> Option<u64> {
        self.nodes.get(hash).map(|node| node.height)
    }

    /// Iterates over every block in no particular order
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.nodes.values().map(|node| &node.block)
    }

    /// Records a block under its parent
    ///
    /// Callers must have validated the block first; the tree only enforces
    /// its own structural invariants.
    pub fn insert(&mut self, block: Block) -> Result<(), TreeError> {
        let hash = block.hash;
        if self.nodes.contains_key(&hash) {
            return Err(TreeError::Duplicate(hash));
        }

        let parent_hash = block.parent.ok_or(TreeError::ForeignRoot(hash))?;
        let parent = self
            .nodes
            .get_mut(&parent_hash)
            .ok_or(TreeError::UnknownParent(parent_hash))?;
        parent.children.insert(hash);
        let height = parent.height + 1;

        self.nodes.insert(
            hash,
            TreeNode {
                block,
                height,
                children: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Hashes of the blocks whose parent is `hash`
    pub fn children_of(&self, hash: &BlockHash) -> BTreeSet<BlockHash> {
        self.nodes
            .get(hash)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    /// Parent hash of a block, `None` for genesis or unknown blocks
    pub fn parent_of(&self, hash: &BlockHash) -> Option<BlockHash> {
        self.nodes.get(hash).and_then(|node| node.block.parent)
    }

    /// Counts the blocks reachable from `root` through child links, `root` included
    pub fn subtree_size(&self, root: &BlockHash) -> Result<usize, TreeError> {
        if !self.nodes.contains_key(root) {
            return Err(TreeError::UnknownBlock(*root));
        }

        let mut size = 0;
        let mut pending = vec![*root];
        while let Some(hash) = pending.pop() {
            size += 1;
            if let Some(node) = self.nodes.get(&hash) {
                pending.extend(node.children.iter().copied());
            }
        }
        Ok(size)
    }

    /// Blocks from genesis to `tip`, both included
    pub fn path_to_root(&self, tip: &BlockHash) -> Result<Vec<&Block>, TreeError> {
        let mut node = self.nodes.get(tip).ok_or(TreeError::UnknownBlock(*tip))?;
        let mut path = Vec::with_capacity(node.height as usize + 1);

        loop {
            path.push(&node.block);
            match node.block.parent {
                Some(parent) => {
                    node = self
                        .nodes
                        .get(&parent)
                        .ok_or(TreeError::UnknownBlock(parent))?;
                }
                None => break,
            }
        }

        path.reverse();
        Ok(path)
    }

    /// Walks from `hash` to its ancestor at `height`
    pub fn ancestor_at(&self, hash: &BlockHash, height: u64) -> Option<BlockHash> {
        let mut current = *hash;
        let mut current_height = self.height(&current)?;
        if height > current_height {
            return None;
        }

        while current_height > height {
            current = self.parent_of(&current)?;
            current_height -= 1;
        }
        Some(current)
    }

    /// Checks whether `ancestor` lies on the path from genesis to `descendant`
    pub fn is_ancestor(&self, ancestor: &BlockHash, descendant: &BlockHash) -> bool {
        match self.height(ancestor) {
            Some(height) => self.ancestor_at(descendant, height) == Some(*ancestor),
            None => false,
        }
    }

    /// Blocks with no children
    pub fn leaves(&self) -> Vec<BlockHash> {
        let mut leaves: Vec<BlockHash> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.children.is_empty())
            .map(|(hash, _)| *hash)
            .collect();
        leaves.sort();
        leaves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::StateStore;
    use crate::blockchain::block::BlockTemplate;

    fn child_of(parent: &Block, nonce: u64) -> Block {
        BlockTemplate::new(parent, 0, Vec::new(), parent.resulting_state.clone()).seal(nonce)
    }

    /// genesis -> a1 -> a2, genesis -> b1 -> {b2, b3}
    fn sample_tree() -> (ChainTree, Vec<Block>) {
        let genesis = Block::genesis(0, StateStore::new());
        let a1 = child_of(&genesis, 1);
        let a2 = child_of(&a1, 2);
        let b1 = child_of(&genesis, 3);
        let b2 = child_of(&b1, 4);
        let b3 = child_of(&b1, 5);

        let mut tree = ChainTree::new(genesis.clone()).unwrap();
        for block in [&a1, &a2, &b1, &b2, &b3] {
            tree.insert(block.clone()).unwrap();
        }
        (tree, vec![genesis, a1, a2, b1, b2, b3])
    }

    #[test]
    fn test_new_tree() {
        let genesis = Block::genesis(0, StateStore::new());
        let tree = ChainTree::new(genesis.clone()).unwrap();

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.genesis(), genesis.hash);
        assert_eq!(tree.height(&genesis.hash), Some(0));
        assert_eq!(tree.subtree_size(&genesis.hash), Ok(1));

        let child = child_of(&genesis, 0);
        assert_eq!(ChainTree::new(child.clone()).unwrap_err(), TreeError::NotARoot(child.hash));
    }

    #[test]
    fn test_insert_links_children() {
        let (tree, blocks) = sample_tree();
        let (genesis, a1, b1) = (&blocks[0], &blocks[1], &blocks[3]);

        assert_eq!(tree.len(), 6);
        assert_eq!(tree.children_of(&genesis.hash), BTreeSet::from([a1.hash, b1.hash]));
        assert_eq!(tree.children_of(&b1.hash), BTreeSet::from([blocks[4].hash, blocks[5].hash]));
        assert!(tree.children_of(&blocks[2].hash).is_empty());
        assert_eq!(tree.height(&blocks[2].hash), Some(2));
        assert_eq!(tree.parent_of(&a1.hash), Some(genesis.hash));
    }

    #[test]
    fn test_insert_rejects_unknown_parent_and_duplicates() {
        let (mut tree, blocks) = sample_tree();

        let stranger_parent = child_of(&Block::genesis(99, StateStore::new()), 0);
        let orphan = child_of(&stranger_parent, 0);
        assert_eq!(tree.insert(orphan).unwrap_err(), TreeError::UnknownParent(stranger_parent.hash));

        assert_eq!(tree.insert(blocks[2].clone()).unwrap_err(), TreeError::Duplicate(blocks[2].hash));

        let other_root = Block::genesis(5, StateStore::new());
        assert_eq!(tree.insert(other_root.clone()).unwrap_err(), TreeError::ForeignRoot(other_root.hash));
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn test_subtree_size() {
        let (tree, blocks) = sample_tree();

        assert_eq!(tree.subtree_size(&blocks[0].hash), Ok(6));
        assert_eq!(tree.subtree_size(&blocks[1].hash), Ok(2));
        assert_eq!(tree.subtree_size(&blocks[3].hash), Ok(3));
        assert_eq!(tree.subtree_size(&blocks[5].hash), Ok(1));

        let unknown = blocks[0].hash.with_bit_flipped(3);
        assert_eq!(tree.subtree_size(&unknown), Err(TreeError::UnknownBlock(unknown)));
    }

    #[test]
    fn test_path_to_root() {
        let (tree, blocks) = sample_tree();

        let path: Vec<BlockHash> = tree
            .path_to_root(&blocks[4].hash)
            .unwrap()
            .iter()
            .map(|block| block.hash)
            .collect();
        assert_eq!(path, vec![blocks[0].hash, blocks[3].hash, blocks[4].hash]);

        let root_path = tree.path_to_root(&blocks[0].hash).unwrap();
        assert_eq!(root_path.len(), 1);
    }

    #[test]
    fn test_ancestry_queries() {
        let (tree, blocks) = sample_tree();

        assert_eq!(tree.ancestor_at(&blocks[2].hash, 1), Some(blocks[1].hash));
        assert_eq!(tree.ancestor_at(&blocks[2].hash, 0), Some(blocks[0].hash));
        assert_eq!(tree.ancestor_at(&blocks[1].hash, 2), None);

        assert!(tree.is_ancestor(&blocks[0].hash, &blocks[5].hash));
        assert!(tree.is_ancestor(&blocks[3].hash, &blocks[3].hash));
        assert!(!tree.is_ancestor(&blocks[1].hash, &blocks[5].hash));

        let mut expected = vec![blocks[2].hash, blocks[4].hash, blocks[5].hash];
        expected.sort();
        assert_eq!(tree.leaves(), expected);
    }
}
