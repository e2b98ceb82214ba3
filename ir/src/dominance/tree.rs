use alloc::vec::Vec;
use core::fmt;

use cranelift_entity::{PrimaryMap, SecondaryMap, entity_impl};
use smallvec::SmallVec;

use super::nca::SemiNCA;
use crate::{Block, ControlFlowGraph};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomTreeError {
    /// Tried to compute a dominator tree for a function with no blocks
    #[error("unable to create dominance tree for a function without blocks")]
    EmptyFunction,
}

/// A forward dominance tree
pub type DominanceTree = DomTreeBase<false>;

/// A post (backward) dominance tree
pub type PostDominanceTree = DomTreeBase<true>;

pub type DomTreeRoots = SmallVec<[Option<Block>; 4]>;

/// A reference to a node of a [DomTreeBase]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomNodeId(u32);
entity_impl!(DomNodeId, "domnode");

/// A dominator tree implementation that abstracts over the type of dominance it represents.
pub struct DomTreeBase<const IS_POST_DOM: bool> {
    /// The roots from which dominance is traced.
    ///
    /// For forward dominance trees, there is always a single root. For post-dominance trees, there
    /// may be multiple, one for each exit from the function, all attached to a virtual root node.
    roots: DomTreeRoots,
    /// The nodes represented in this dominance tree
    nodes: PrimaryMap<DomNodeId, DomTreeNode>,
    /// The node of each block, if the block is in the tree
    block_nodes: SecondaryMap<Block, Option<DomNodeId>>,
    /// The root dominance tree node.
    root: DomNodeId,
}

/// A node in a [DomTreeBase].
#[derive(Clone)]
pub struct DomTreeNode {
    /// The block represented by this node, `None` for the virtual root of a post-dominator tree
    block: Option<Block>,
    /// The immediate dominator of this node, if applicable
    idom: Option<DomNodeId>,
    /// The children of this node in the tree
    children: SmallVec<[DomNodeId; 4]>,
    /// The depth of this node in the tree
    level: u32,
    /// The DFS visitation order (forward)
    num_in: u32,
    /// The DFS visitation order (backward)
    num_out: u32,
}

impl fmt::Display for DomTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(block) => write!(f, "{block}"),
            None => f.write_str("<virtual>"),
        }
    }
}

impl fmt::Debug for DomTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomTreeNode")
            .field("block", &self.block)
            .field("idom", &self.idom)
            .field("children", &self.children)
            .field("level", &self.level)
            .field("num_in", &self.num_in)
            .field("num_out", &self.num_out)
            .finish()
    }
}

impl DomTreeNode {
    #[inline]
    pub fn block(&self) -> Option<Block> {
        self.block
    }

    #[inline]
    pub fn idom(&self) -> Option<DomNodeId> {
        self.idom
    }

    #[inline]
    pub fn children(&self) -> &[DomNodeId] {
        &self.children
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns true if `self` is dominated by `other`, using the DFS numbering of the tree
    #[inline]
    pub fn is_dominated_by(&self, other: &Self) -> bool {
        self.num_in >= other.num_in && self.num_out <= other.num_out
    }
}

impl<const IS_POST_DOM: bool> fmt::Debug for DomTreeBase<IS_POST_DOM> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomTreeBase")
            .field("post_dom", &IS_POST_DOM)
            .field("roots", &self.roots)
            .field("root", &self.nodes[self.root].block)
            .field("nodes", &self.nodes.values().collect::<Vec<_>>())
            .finish()
    }
}

impl<const IS_POST_DOM: bool> DomTreeBase<IS_POST_DOM> {
    /// Compute the dominance tree for the function represented by `cfg`
    pub fn new(cfg: &ControlFlowGraph) -> Result<Self, DomTreeError> {
        let mut snca = SemiNCA::<IS_POST_DOM>::compute(cfg)?;
        let roots = snca.take_roots();

        let mut nodes = PrimaryMap::<DomNodeId, DomTreeNode>::new();
        let mut block_nodes = SecondaryMap::<Block, Option<DomNodeId>>::new();
        let mut num_to_id = alloc::vec![None; snca.len()];

        // DFS numbers are assigned in preorder, so an immediate dominator is always numbered before
        // the nodes it dominates
        for num in 1..snca.len() {
            let block = snca.block(num);
            let idom = if num == 1 { None } else { num_to_id[snca.idom(num)] };
            let level = idom.map(|idom: DomNodeId| nodes[idom].level + 1).unwrap_or(0);
            let id = nodes.push(DomTreeNode {
                block,
                idom,
                children: SmallVec::new(),
                level,
                num_in: 0,
                num_out: 0,
            });
            if let Some(idom) = idom {
                nodes[idom].children.push(id);
            }
            if let Some(block) = block {
                block_nodes[block] = Some(id);
            }
            num_to_id[num] = Some(id);
        }

        let root = num_to_id[1].ok_or(DomTreeError::EmptyFunction)?;
        let mut tree = Self {
            roots,
            nodes,
            block_nodes,
            root,
        };
        tree.update_dfs_numbers();

        log::trace!(
            target: "dominance",
            "computed {} tree with {} nodes",
            if IS_POST_DOM { "post-dominance" } else { "dominance" },
            tree.nodes.len()
        );

        Ok(tree)
    }

    #[inline]
    pub const fn is_post_dominator(&self) -> bool {
        IS_POST_DOM
    }

    /// The roots from which dominance is traced
    #[inline]
    pub fn roots(&self) -> &[Option<Block>] {
        &self.roots
    }

    /// The block represented by the root node, or `None` if the root is virtual
    #[inline]
    pub fn root(&self) -> Option<Block> {
        self.nodes[self.root].block
    }

    #[inline]
    pub fn root_id(&self) -> DomNodeId {
        self.root
    }

    #[inline]
    pub fn root_node(&self) -> &DomTreeNode {
        &self.nodes[self.root]
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn node(&self, id: DomNodeId) -> &DomTreeNode {
        &self.nodes[id]
    }

    /// The tree node of `block`, if it is in the tree
    #[inline]
    pub fn node_id(&self, block: Block) -> Option<DomNodeId> {
        self.block_nodes.get(block).copied().flatten()
    }

    /// Get the node for `block`, or `None` if the block is not in the tree, i.e. unreachable
    #[inline]
    pub fn get(&self, block: Block) -> Option<&DomTreeNode> {
        self.node_id(block).map(|id| &self.nodes[id])
    }

    /// The immediate dominator of `block`, if it has one
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.get(block)?.idom.and_then(|idom| self.nodes[idom].block)
    }

    /// The depth of `block` in the tree
    pub fn level(&self, block: Block) -> Option<u32> {
        self.get(block).map(|node| node.level)
    }

    /// The blocks immediately dominated by `block`
    pub fn children(&self, block: Block) -> SmallVec<[Block; 4]> {
        self.get(block)
            .map(|node| node.children.iter().filter_map(|child| self.nodes[*child].block).collect())
            .unwrap_or_default()
    }

    /// Returns true if `block` is reachable from the entry block (or from an exit, for
    /// post-dominance)
    #[inline]
    pub fn is_reachable_from_entry(&self, block: Block) -> bool {
        self.node_id(block).is_some()
    }

    /// Returns true iff `a` dominates `b`.
    ///
    /// A block dominates itself. Every block dominates an unreachable block, and an unreachable
    /// block dominates nothing but itself.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }

        // An unreachable node is dominated by anything
        let Some(b) = self.get(b) else {
            return true;
        };

        // And dominates nothing.
        let Some(a) = self.get(a) else {
            return false;
        };

        // A can only dominate B if it is higher in the tree
        if a.level >= b.level {
            return false;
        }

        b.is_dominated_by(a)
    }

    /// Returns true iff `a` dominates `b` and `a != b`
    #[inline]
    pub fn properly_dominates(&self, a: Block, b: Block) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Finds the nearest block which is a common dominator of both `a` and `b`
    pub fn find_nearest_common_dominator(&self, a: Block, b: Block) -> Option<Block> {
        let mut a = self.node_id(a)?;
        let mut b = self.node_id(b)?;

        // Use level information to go up the tree until the levels match. Then continue going up
        // until we arrive at the same node.
        while a != b {
            if self.nodes[a].level < self.nodes[b].level {
                core::mem::swap(&mut a, &mut b);
            }

            a = self.nodes[a].idom?;
        }

        self.nodes[a].block
    }

    /// The nodes of the tree in preorder, starting from the root.
    ///
    /// Children are visited in the order they were attached to their parent.
    pub fn preorder(&self) -> Vec<DomNodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = SmallVec::<[DomNodeId; 32]>::from_iter([self.root]);
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
        order
    }

    /// Assign in/out numbers to each node using a depth-first walk of the tree, so that dominance
    /// queries can be answered in constant time.
    fn update_dfs_numbers(&mut self) {
        let mut dfs_num = 0u32;
        let mut stack = SmallVec::<[(DomNodeId, usize); 32]>::new();

        self.nodes[self.root].num_in = dfs_num;
        dfs_num += 1;
        stack.push((self.root, 0));

        while let Some((node, next_child)) = stack.last().copied() {
            match self.nodes[node].children.get(next_child).copied() {
                Some(child) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    self.nodes[child].num_in = dfs_num;
                    dfs_num += 1;
                    stack.push((child, 0));
                }
                None => {
                    self.nodes[node].num_out = dfs_num;
                    dfs_num += 1;
                    stack.pop();
                }
            }
        }
    }
}
