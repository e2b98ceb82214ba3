use alloc::{rc::Rc, vec::Vec};

use memssa_ir::{
    Block, DomNodeId, ForwardIdfCalculator, FxHashSet, Function, Inst, IntrinsicId, SmallVec,
};

use super::{MemoryAccess, MemoryAccessId, MemoryAccessKind, MemorySsa};
use crate::AliasAnalysis;

/// The state of one level of the explicit dominator tree walk performed by renaming
#[derive(Copy, Clone)]
struct RenamePassData {
    node: DomNodeId,
    /// The index of the next child of `node` to visit
    next_child: usize,
    /// The reaching definition at the end of `node`'s block
    incoming: MemoryAccessId,
}

impl MemorySsa {
    pub(super) fn build_memory_ssa(&mut self, func: &Function, aa: &dyn AliasAnalysis) {
        log::debug!(target: "memssa:builder", "building memory ssa for '{}'", func.name);

        let mut defining_blocks = Vec::new();
        for block in func.layout.blocks().iter().copied() {
            let mut accesses = Vec::new();
            let mut defs = Vec::new();
            for inst in func.layout.block_insts(block).iter().copied() {
                let Some(access) = self.create_new_access(func, aa, inst, block) else {
                    continue;
                };
                accesses.push(access);
                if self.access(access).is_def() {
                    defs.push(access);
                }
            }

            if !defs.is_empty() {
                defining_blocks.push(block);
                self.per_block_defs.insert(block, defs);
            }
            if !accesses.is_empty() {
                self.per_block_accesses.insert(block, accesses);
            }
        }

        self.place_phi_nodes(func, &defining_blocks);

        let mut visited = FxHashSet::default();
        if let Some(entry) = self.domtree.root() {
            let live_on_entry = self.live_on_entry;
            self.rename_pass(entry, live_on_entry, &mut visited, false, false);
        }

        // Anything the renamer did not reach is unreachable, and observes nothing but the state
        // of memory on entry
        for block in func.layout.blocks().iter().copied() {
            if !visited.contains(&block) {
                self.mark_unreachable_as_live_on_entry(block);
            }
        }
    }

    /// Create (but do not place in any list) the access for `inst`, if it touches memory.
    ///
    /// Instructions which may write memory, and loads or stores with ordering constraints, are
    /// definitions. Instructions which only read memory are uses.
    pub(super) fn create_new_access(
        &mut self,
        func: &Function,
        aa: &dyn AliasAnalysis,
        inst: Inst,
        block: Block,
    ) -> Option<MemoryAccessId> {
        let data = func.inst(inst);

        // Assumptions are modeled as touching memory only to keep them in place
        if data.intrinsic_id() == Some(IntrinsicId::Assume) {
            return None;
        }

        let mod_ref = aa.mod_ref_info(func, inst);
        let is_def = mod_ref.is_mod() || data.is_ordered_access();
        if !is_def && !mod_ref.is_ref() {
            return None;
        }

        let access = if is_def {
            MemoryAccess::new_def(self.next_def_id(), block, Some(inst))
        } else {
            MemoryAccess::new_use(block, inst)
        };
        let id = self.accesses.push(Some(access));
        self.inst_accesses.insert(inst, id);
        Some(id)
    }

    /// Place a phi at the start of every block in the iterated dominance frontier of the blocks
    /// containing definitions
    fn place_phi_nodes(&mut self, func: &Function, defining_blocks: &[Block]) {
        let domtree = Rc::clone(&self.domtree);
        let cfg = Rc::clone(&self.cfg);
        let mut idf = ForwardIdfCalculator::new(&domtree, &cfg);
        idf.set_defining_blocks(defining_blocks.iter().copied());

        let mut phi_blocks = idf.calculate();
        phi_blocks.sort_by_key(|block| func.layout.block_position(*block));

        log::debug!(target: "memssa:builder", "placing {} memory phis", phi_blocks.len());
        for block in phi_blocks {
            self.create_memory_phi(block);
        }
    }

    /// Rename the accesses dominated by `root`, given that `incoming` reaches the start of `root`.
    ///
    /// Every use or definition is pointed at the reaching definition, and the reaching
    /// definition at the end of each block is appended as the incoming value of the phis of its
    /// successors. Blocks are added to `visited` as they are renamed.
    ///
    /// This form is meant for renaming part of the graph after it has been mutated: blocks
    /// already in `visited` are skipped, uses and definitions are renamed even if they already
    /// have a defining access, and successor phis must already have an incoming value for each
    /// renamed predecessor, which is overwritten.
    pub fn rename_from(
        &mut self,
        root: Block,
        incoming: MemoryAccessId,
        visited: &mut FxHashSet<Block>,
    ) {
        self.rename_pass(root, incoming, visited, true, true);
    }

    fn rename_pass(
        &mut self,
        root: Block,
        incoming: MemoryAccessId,
        visited: &mut FxHashSet<Block>,
        skip_visited: bool,
        rename_all_uses: bool,
    ) {
        let domtree = Rc::clone(&self.domtree);
        let Some(root_node) = domtree.node_id(root) else {
            return;
        };

        // Record the visit regardless of whether renaming is skipped
        let already_visited = !visited.insert(root);
        if skip_visited && already_visited {
            return;
        }

        let incoming = self.rename_block(root, incoming, rename_all_uses);
        self.rename_successor_phis(root, incoming, rename_all_uses);

        let mut stack = SmallVec::<[RenamePassData; 32]>::new();
        stack.push(RenamePassData {
            node: root_node,
            next_child: 0,
            incoming,
        });
        while let Some(top) = stack.last_mut() {
            let Some(child) = domtree.node(top.node).children().get(top.next_child).copied() else {
                stack.pop();
                continue;
            };
            top.next_child += 1;
            let mut incoming = top.incoming;

            let Some(block) = domtree.node(child).block() else {
                continue;
            };
            let already_visited = !visited.insert(block);
            if skip_visited && already_visited {
                // A phi alone does not change the reaching definition at the end of the block
                if let Some(last) = self.block_defs(block).and_then(|defs| defs.last()) {
                    incoming = *last;
                }
            } else {
                incoming = self.rename_block(block, incoming, rename_all_uses);
            }
            self.rename_successor_phis(block, incoming, rename_all_uses);
            stack.push(RenamePassData {
                node: child,
                next_child: 0,
                incoming,
            });
        }
    }

    /// Rename the accesses of `block`, returning the reaching definition at its end
    fn rename_block(
        &mut self,
        block: Block,
        mut incoming: MemoryAccessId,
        rename_all_uses: bool,
    ) -> MemoryAccessId {
        let len = self.per_block_accesses.get(&block).map_or(0, Vec::len);
        for index in 0..len {
            let id = self.per_block_accesses[&block][index];
            let (is_def, defining) = match &self.access(id).kind {
                MemoryAccessKind::Phi(_) => {
                    incoming = id;
                    continue;
                }
                MemoryAccessKind::Def(access) => (true, access.defining),
                MemoryAccessKind::Use(access) => (false, access.defining),
            };
            if defining.is_none() || rename_all_uses {
                self.set_defining_access(id, incoming);
            }
            if is_def {
                incoming = id;
            }
        }
        incoming
    }

    /// Pass the reaching definition at the end of `block` to the phis of its successors
    fn rename_successor_phis(
        &mut self,
        block: Block,
        incoming: MemoryAccessId,
        rename_all_uses: bool,
    ) {
        let cfg = Rc::clone(&self.cfg);
        for succ in cfg.successors(block).iter().copied() {
            let Some(phi) = self.memory_phi(succ) else {
                continue;
            };
            if rename_all_uses {
                let replaced = self.set_incoming_value_for_block(phi, block, incoming);
                assert!(replaced, "incomplete phi {phi} during partial rename");
            } else {
                self.add_incoming(phi, block, incoming);
            }
        }
    }

    /// Make everything in the unreachable `block` observe the live-on-entry definition.
    ///
    /// Phis of reachable successors receive live-on-entry along the edge from `block`, so they
    /// keep one incoming value per predecessor. A phi in `block` itself is removed.
    pub(crate) fn mark_unreachable_as_live_on_entry(&mut self, block: Block) {
        assert!(
            !self.domtree.is_reachable_from_entry(block),
            "reachable block {block} found while handling unreachable blocks"
        );
        let live_on_entry = self.live_on_entry;

        let cfg = Rc::clone(&self.cfg);
        for succ in cfg.successors(block).iter().copied() {
            if !self.domtree.is_reachable_from_entry(succ) {
                continue;
            }
            let Some(phi) = self.memory_phi(succ) else {
                continue;
            };
            let has_edge = self
                .access(phi)
                .as_phi()
                .is_some_and(|phi| phi.incoming_value_for_block(block).is_some());
            if !has_edge {
                self.add_incoming(phi, block, live_on_entry);
            }
        }

        let Some(accesses) = self.per_block_accesses.get(&block).cloned() else {
            return;
        };
        for id in accesses {
            if self.access(id).is_phi() {
                self.replace_all_uses_with(id, live_on_entry);
                self.remove_from_lookups_and_lists(id);
            } else {
                self.set_defining_access(id, live_on_entry);
            }
        }
    }
}
