use alloc::vec::Vec;

use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;

use crate::{Block, Function};

/// The predecessor and successor relations between the blocks of a [Function].
///
/// Each relation is deduplicated: a block which branches to the same destination on both arms of
/// a conditional branch contributes a single edge.
#[derive(Debug, Default, Clone)]
pub struct ControlFlowGraph {
    preds: SecondaryMap<Block, SmallVec<[Block; 4]>>,
    succs: SecondaryMap<Block, SmallVec<[Block; 2]>>,
    entry: Option<Block>,
    blocks: Vec<Block>,
}

impl ControlFlowGraph {
    /// Compute the control flow graph of `func`
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self {
            entry: func.entry_block(),
            blocks: func.layout.blocks().to_vec(),
            ..Default::default()
        };

        for block in func.layout.blocks().iter().copied() {
            let Some(terminator) = func.layout.last_inst(block) else {
                continue;
            };
            for succ in func.inst(terminator).successors() {
                cfg.succs[block].push(succ);
                if !cfg.preds[succ].contains(&block) {
                    cfg.preds[succ].push(block);
                }
            }
        }

        cfg
    }

    /// The entry block of the underlying function
    #[inline]
    pub fn entry_block(&self) -> Option<Block> {
        self.entry
    }

    /// All blocks in layout order
    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn predecessors(&self, block: Block) -> &[Block] {
        &self.preds[block]
    }

    #[inline]
    pub fn successors(&self, block: Block) -> &[Block] {
        &self.succs[block]
    }

    #[inline]
    pub fn num_predecessors(&self, block: Block) -> usize {
        self.preds[block].len()
    }

    /// Get the successors (or predecessors, if `INVERSED == true`) of `block`.
    ///
    /// This is used to abstract over the direction of a traversal, e.g. when computing
    /// post-dominance or a reverse iterated dominance frontier.
    #[inline]
    pub fn children<const INVERSED: bool>(&self, block: Block) -> &[Block] {
        if INVERSED {
            self.predecessors(block)
        } else {
            self.successors(block)
        }
    }

    /// Blocks with no successors
    pub fn exit_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.iter().copied().filter(|b| self.succs[*b].is_empty())
    }

    /// The blocks reachable from the entry block, in post-order
    pub fn postorder(&self) -> Vec<Block> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let Some(entry) = self.entry else {
            return order;
        };

        let mut visited = SecondaryMap::<Block, bool>::new();
        let mut stack = SmallVec::<[(Block, usize); 32]>::from_iter([(entry, 0)]);
        visited[entry] = true;
        while let Some((block, next_succ)) = stack.last().copied() {
            match self.succs[block].get(next_succ).copied() {
                Some(succ) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    if !visited[succ] {
                        visited[succ] = true;
                        stack.push((succ, 0));
                    }
                }
                None => {
                    order.push(block);
                    stack.pop();
                }
            }
        }
        order
    }

    /// The blocks reachable from the entry block, in reverse post-order
    pub fn reverse_postorder(&self) -> Vec<Block> {
        let mut order = self.postorder();
        order.reverse();
        order
    }
}
