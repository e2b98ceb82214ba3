use alloc::{collections::BinaryHeap, vec::Vec};

use bitvec::vec::BitVec;
use smallvec::SmallVec;

use super::{DomNodeId, DomTreeBase};
use crate::{Block, ControlFlowGraph, EntityRef, FxHashSet};

/// Computes the iterated dominance frontier of a set of defining blocks.
///
/// This is the set of blocks where a phi is needed to merge the definitions flowing in along
/// different paths, i.e. `DF+(defining_blocks)`. It uses the linear-time algorithm from Sreedhar
/// and Gao, "A linear time algorithm for placing phi-nodes", which visits the dominator tree in
/// decreasing order of level using a priority queue, and so never materializes the dominance
/// frontier of any individual block.
///
/// When `IS_POST_DOM` is true, the calculation runs over the post-dominator tree and the reversed
/// control flow graph, yielding the reverse iterated dominance frontier.
///
/// The resulting blocks can optionally be pruned to the set of blocks in which the value is
/// live-in, see [IdfCalculator::set_live_in_blocks].
pub struct IdfCalculator<'a, const IS_POST_DOM: bool> {
    domtree: &'a DomTreeBase<IS_POST_DOM>,
    cfg: &'a ControlFlowGraph,
    defining_blocks: FxHashSet<Block>,
    live_in_blocks: Option<FxHashSet<Block>>,
}

pub type ForwardIdfCalculator<'a> = IdfCalculator<'a, false>;
pub type ReverseIdfCalculator<'a> = IdfCalculator<'a, true>;

impl<'a, const IS_POST_DOM: bool> IdfCalculator<'a, IS_POST_DOM> {
    pub fn new(domtree: &'a DomTreeBase<IS_POST_DOM>, cfg: &'a ControlFlowGraph) -> Self {
        Self {
            domtree,
            cfg,
            defining_blocks: FxHashSet::default(),
            live_in_blocks: None,
        }
    }

    /// Give the calculator the set of blocks in which the value is defined
    pub fn set_defining_blocks<I>(&mut self, blocks: I)
    where
        I: IntoIterator<Item = Block>,
    {
        self.defining_blocks = blocks.into_iter().collect();
    }

    /// Give the calculator the set of blocks in which the value is live on entry.
    ///
    /// Only blocks in this set will be returned by [Self::calculate].
    pub fn set_live_in_blocks<I>(&mut self, blocks: I)
    where
        I: IntoIterator<Item = Block>,
    {
        self.live_in_blocks = Some(blocks.into_iter().collect());
    }

    /// Reset the live-in block set to be empty, and tell the calculator to not prune the results
    pub fn reset_live_in_blocks(&mut self) {
        self.live_in_blocks = None;
    }

    /// Calculate the iterated dominance frontier of the defining blocks.
    ///
    /// The order of the returned blocks is unspecified, callers that need a deterministic order
    /// must sort the result.
    pub fn calculate(&self) -> Vec<Block> {
        let mut idf = Vec::new();

        // Use a priority queue keyed on dominator tree level so that inserted nodes are handled
        // from the bottom of the dominator tree upwards. We also augment the level with a DFS
        // number to ensure that the blocks are ordered in a deterministic way.
        let mut pq = BinaryHeap::<(u32, DomNodeId)>::new();

        let num_nodes = self.domtree.num_nodes();
        let mut visited_pq = BitVec::<usize>::repeat(false, num_nodes);
        let mut visited_worklist = BitVec::<usize>::repeat(false, num_nodes);

        for block in self.defining_blocks.iter().copied() {
            if let Some(id) = self.domtree.node_id(block) {
                pq.push((self.domtree.node(id).level(), id));
                visited_pq.set(id.index(), true);
            }
        }

        let mut worklist = SmallVec::<[DomNodeId; 32]>::new();
        while let Some((root_level, root)) = pq.pop() {
            // Walk all dominator tree children of root, inspecting their CFG edges with targets
            // elsewhere on the dominator tree. Only targets whose level is at most root's level
            // are added to the iterated dominance frontier of the definition set.
            worklist.clear();
            worklist.push(root);
            visited_worklist.set(root.index(), true);

            while let Some(id) = worklist.pop() {
                let node = self.domtree.node(id);
                let Some(bb) = node.block() else {
                    continue;
                };

                for succ in self.cfg.children::<IS_POST_DOM>(bb).iter().copied() {
                    let Some(succ_id) = self.domtree.node_id(succ) else {
                        continue;
                    };
                    let succ_node = self.domtree.node(succ_id);

                    // Quickly skip all CFG edges that are also dominator tree edges instead of
                    // catching them below.
                    if succ_node.idom() == Some(id) {
                        continue;
                    }

                    let succ_level = succ_node.level();
                    if succ_level > root_level {
                        continue;
                    }

                    if visited_pq[succ_id.index()] {
                        continue;
                    }
                    visited_pq.set(succ_id.index(), true);

                    if let Some(live_in) = self.live_in_blocks.as_ref()
                        && !live_in.contains(&succ)
                    {
                        continue;
                    }

                    log::trace!(target: "idf", "{succ} is in the iterated dominance frontier");
                    idf.push(succ);
                    if !self.defining_blocks.contains(&succ) {
                        pq.push((succ_level, succ_id));
                    }
                }

                for child in node.children().iter().copied() {
                    if !visited_worklist[child.index()] {
                        visited_worklist.set(child.index(), true);
                        worklist.push(child);
                    }
                }
            }
        }

        idf
    }
}
