//! Memory SSA: a factored def-use graph over the memory effects of a function.
//!
//! Every instruction which may read or write memory gets a [MemoryAccess]: a `MemoryDef` for
//! anything which may write memory (or must be treated as though it does, like a fence or a
//! volatile load), and a `MemoryUse` for anything which only reads it. All of memory is treated
//! as a single variable, so each access has exactly one *defining access*, the nearest dominating
//! definition, and a `MemoryPhi` merges the reaching definitions at control-flow joins. A
//! distinguished live-on-entry definition stands for the state of memory on entry to the
//! function.
//!
//! The defining access is a conservative answer to the question "which write may have produced
//! the value observed here". A [MemorySsaWalker] refines it on demand into the *clobbering*
//! access for the location actually touched, skipping over definitions which provably do not
//! affect it. Uses are refined eagerly as part of construction unless disabled through
//! [MemorySsaConfig].
//!
//! The graph is owned by a [MemorySsa] instance. Accesses live in an arena and are referred to by
//! [MemoryAccessId]; each block keeps its accesses, and separately its definitions and phi, in
//! program order.
mod access;
mod builder;
mod caching;
mod optimize_uses;
mod print;
#[cfg(test)]
mod tests;
mod update;
mod verify;
mod walker;

use alloc::{rc::Rc, vec::Vec};
use core::cell::RefCell;

use memssa_ir::{
    Block, ControlFlowGraph, DomTreeError, DominanceTree, FxHashMap, FxHashSet, Function, Inst,
    PrimaryMap, SmallVec,
};

pub use self::{
    access::{MemoryAccess, MemoryAccessId, MemoryAccessKind, MemoryPhi, MemoryUseOrDef},
    caching::{CachingWalker, DoNothingWalker, MemorySsaWalker},
    print::{DisplayMemoryAccess, DisplayMemorySsa},
    update::InsertionPlace,
};
use crate::{AliasAnalysis, MemorySsaConfig, MemorySsaError};

/// The Memory SSA form of a single function.
///
/// The graph refers to instructions and blocks of the [Function] it was built from, but does not
/// borrow it: every operation which needs to look at instructions takes the function as an
/// argument, and it is up to the caller to keep the two in sync when mutating either.
pub struct MemorySsa {
    config: MemorySsaConfig,
    cfg: Rc<ControlFlowGraph>,
    domtree: Rc<DominanceTree>,
    /// Every access ever created, removed accesses are left behind as `None`
    accesses: PrimaryMap<MemoryAccessId, Option<MemoryAccess>>,
    live_on_entry: MemoryAccessId,
    /// The accesses of each block, in program order, phi first
    per_block_accesses: FxHashMap<Block, Vec<MemoryAccessId>>,
    /// The definitions and phi of each block, in program order, phi first
    per_block_defs: FxHashMap<Block, Vec<MemoryAccessId>>,
    inst_accesses: FxHashMap<Inst, MemoryAccessId>,
    block_phis: FxHashMap<Block, MemoryAccessId>,
    /// The position of each access in its block, starting from 1.
    ///
    /// Only meaningful for blocks in `block_numbering_valid`, and computed on demand by local
    /// dominance queries.
    block_numbering: RefCell<FxHashMap<MemoryAccessId, u32>>,
    block_numbering_valid: RefCell<FxHashSet<Block>>,
    /// For each access, the uses and definitions whose cached clobber may be that access
    optimized_by: RefCell<FxHashMap<MemoryAccessId, SmallVec<[MemoryAccessId; 2]>>>,
    /// The next printable number for a definition or phi
    next_id: u32,
}

impl MemorySsa {
    /// Build Memory SSA for `func` with the default configuration
    pub fn build(func: &Function, aa: &dyn AliasAnalysis) -> Result<Self, MemorySsaError> {
        Self::build_with_config(func, aa, MemorySsaConfig::default())
    }

    /// Build Memory SSA for `func`, computing the control flow graph and dominator tree it needs
    pub fn build_with_config(
        func: &Function,
        aa: &dyn AliasAnalysis,
        config: MemorySsaConfig,
    ) -> Result<Self, MemorySsaError> {
        let cfg = Rc::new(ControlFlowGraph::with_function(func));
        let domtree = Rc::new(DominanceTree::new(&cfg)?);
        Self::new(func, aa, cfg, domtree, config)
    }

    /// Build Memory SSA for `func` from a precomputed control flow graph and dominator tree.
    ///
    /// Both must be up to date with respect to `func`.
    pub fn new(
        func: &Function,
        aa: &dyn AliasAnalysis,
        cfg: Rc<ControlFlowGraph>,
        domtree: Rc<DominanceTree>,
        config: MemorySsaConfig,
    ) -> Result<Self, MemorySsaError> {
        let entry = func.entry_block().ok_or(DomTreeError::EmptyFunction)?;

        let mut accesses = PrimaryMap::new();
        let live_on_entry = accesses.push(Some(MemoryAccess::new_def(0, entry, None)));

        let mut mssa = Self {
            config,
            cfg,
            domtree,
            accesses,
            live_on_entry,
            per_block_accesses: Default::default(),
            per_block_defs: Default::default(),
            inst_accesses: Default::default(),
            block_phis: Default::default(),
            block_numbering: Default::default(),
            block_numbering_valid: Default::default(),
            optimized_by: Default::default(),
            next_id: 1,
        };

        mssa.build_memory_ssa(func, aa);

        if mssa.config.should_optimize_uses() {
            optimize_uses::OptimizeUses::new(&mssa, func, aa).optimize_uses();
        }

        log::debug!(
            target: "memssa",
            "built memory ssa for '{}': {} accesses",
            func.name,
            mssa.accesses().count()
        );

        Ok(mssa)
    }

    #[inline]
    pub fn config(&self) -> &MemorySsaConfig {
        &self.config
    }

    #[inline]
    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    #[inline]
    pub fn domtree(&self) -> &DominanceTree {
        &self.domtree
    }

    /// The definition standing for the state of memory on entry to the function
    #[inline]
    pub fn live_on_entry_def(&self) -> MemoryAccessId {
        self.live_on_entry
    }

    #[inline]
    pub fn is_live_on_entry_def(&self, access: MemoryAccessId) -> bool {
        access == self.live_on_entry
    }

    /// Get the access for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was removed from the graph.
    #[track_caller]
    pub fn access(&self, id: MemoryAccessId) -> &MemoryAccess {
        match self.accesses.get(id) {
            Some(Some(access)) => access,
            _ => panic!("use of removed memory access {id}"),
        }
    }

    #[track_caller]
    pub(crate) fn access_mut(&mut self, id: MemoryAccessId) -> &mut MemoryAccess {
        match self.accesses.get_mut(id) {
            Some(Some(access)) => access,
            _ => panic!("use of removed memory access {id}"),
        }
    }

    /// Returns true if `id` refers to an access which has not been removed
    #[inline]
    pub fn is_valid_access(&self, id: MemoryAccessId) -> bool {
        matches!(self.accesses.get(id), Some(Some(_)))
    }

    /// All live accesses, in creation order
    pub fn accesses(&self) -> impl Iterator<Item = (MemoryAccessId, &MemoryAccess)> + '_ {
        self.accesses.iter().filter_map(|(id, access)| access.as_ref().map(|access| (id, access)))
    }

    /// The use or definition of `inst`, if it touches memory
    #[inline]
    pub fn memory_access(&self, inst: Inst) -> Option<MemoryAccessId> {
        self.inst_accesses.get(&inst).copied()
    }

    /// The phi of `block`, if it has one
    #[inline]
    pub fn memory_phi(&self, block: Block) -> Option<MemoryAccessId> {
        self.block_phis.get(&block).copied()
    }

    /// The accesses of `block` in program order, or `None` if it has none
    #[inline]
    pub fn block_accesses(&self, block: Block) -> Option<&[MemoryAccessId]> {
        self.per_block_accesses.get(&block).map(Vec::as_slice)
    }

    /// The definitions (including the phi) of `block` in program order, or `None` if it has none
    #[inline]
    pub fn block_defs(&self, block: Block) -> Option<&[MemoryAccessId]> {
        self.per_block_defs.get(&block).map(Vec::as_slice)
    }

    /// Get a caching clobber walker over this graph
    pub fn walker<'a>(&'a self, func: &'a Function, aa: &'a dyn AliasAnalysis) -> CachingWalker<'a> {
        CachingWalker::new(self, func, aa)
    }

    /// Find the clobbering access of `access` with a fresh caching walker
    pub fn clobbering_access(
        &self,
        func: &Function,
        aa: &dyn AliasAnalysis,
        access: MemoryAccessId,
    ) -> MemoryAccessId {
        self.walker(func, aa).clobbering_access(access)
    }

    fn next_def_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Record that `user` refers to `def`
    fn add_user(&mut self, def: MemoryAccessId, user: MemoryAccessId) {
        self.access_mut(def).users.push(user);
    }

    /// Forget one reference of `user` to `def`
    fn remove_user(&mut self, def: MemoryAccessId, user: MemoryAccessId) {
        let users = &mut self.access_mut(def).users;
        if let Some(index) = users.iter().position(|u| *u == user) {
            users.remove(index);
        }
    }

    /// Cache `clobber` as the clobbering access of the use or definition `access`
    pub(crate) fn set_optimized(&self, access: MemoryAccessId, clobber: MemoryAccessId) {
        let Some(use_or_def) = self.access(access).as_use_or_def() else {
            return;
        };
        if let Some(old) = use_or_def.optimized.replace(Some(clobber))
            && old != clobber
        {
            self.forget_optimized_by(old, access);
        }
        let mut optimized_by = self.optimized_by.borrow_mut();
        let entry = optimized_by.entry(clobber).or_default();
        if !entry.contains(&access) {
            entry.push(access);
        }
    }

    /// Drop the cached clobbering access of `access`, if any
    pub(crate) fn reset_optimized(&self, access: MemoryAccessId) {
        let Some(use_or_def) = self.access(access).as_use_or_def() else {
            return;
        };
        if let Some(old) = use_or_def.optimized.take() {
            self.forget_optimized_by(old, access);
        }
    }

    /// Remove `access` from the accesses whose cached clobber is `clobber`
    fn forget_optimized_by(&self, clobber: MemoryAccessId, access: MemoryAccessId) {
        let mut optimized_by = self.optimized_by.borrow_mut();
        if let Some(dependents) = optimized_by.get_mut(&clobber) {
            dependents.retain(|dependent| *dependent != access);
            if dependents.is_empty() {
                optimized_by.remove(&clobber);
            }
        }
    }

    /// Drop every cached clobbering access which refers to `clobber`
    fn reset_optimized_referring_to(&self, clobber: MemoryAccessId) {
        let Some(dependents) = self.optimized_by.borrow_mut().remove(&clobber) else {
            return;
        };
        for dependent in dependents {
            if let Some(use_or_def) = self.cached_use_or_def(dependent)
                && use_or_def.optimized.get() == Some(clobber)
            {
                use_or_def.optimized.set(None);
            }
        }
    }

    /// Drop every cached clobbering access in the graph.
    ///
    /// A walk through a phi visits definitions in blocks which do not dominate the access it
    /// started from, so a change to any definition or phi may invalidate any cached result.
    pub(crate) fn reset_all_optimized(&self) {
        let optimized_by = core::mem::take(&mut *self.optimized_by.borrow_mut());
        if optimized_by.is_empty() {
            return;
        }
        log::trace!(target: "memssa", "dropping all cached clobbers");
        for dependent in optimized_by.into_values().flatten() {
            if let Some(use_or_def) = self.cached_use_or_def(dependent) {
                use_or_def.optimized.set(None);
            }
        }
    }

    fn cached_use_or_def(&self, access: MemoryAccessId) -> Option<&MemoryUseOrDef> {
        match self.accesses.get(access) {
            Some(Some(access)) => access.as_use_or_def(),
            _ => None,
        }
    }

    /// Number the accesses of `block` by their position
    fn renumber_block(&self, block: Block) {
        let mut numbering = self.block_numbering.borrow_mut();
        for (index, access) in self.block_accesses(block).unwrap_or_default().iter().enumerate() {
            numbering.insert(*access, index as u32 + 1);
        }
        self.block_numbering_valid.borrow_mut().insert(block);
    }

    fn invalidate_block_numbering(&mut self, block: Block) {
        self.block_numbering_valid.get_mut().remove(&block);
    }
}
