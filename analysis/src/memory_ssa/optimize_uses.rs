use alloc::vec::Vec;

use memssa_ir::{Block, FuncRef, Function, FxHashMap, Inst, InstData, IntrinsicId, Value};
use smallvec::SmallVec;

use super::{
    CachingWalker, MemoryAccessId, MemoryAccessKind, MemorySsa, MemorySsaWalker,
    caching::is_use_trivially_optimizable_to_live_on_entry,
    walker::{UpwardsMemoryQuery, instruction_clobbers_query},
};
use crate::{AliasAnalysis, MemoryLocation};

/// What is called by a call instruction
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum Callee {
    Function(FuncRef),
    Intrinsic(IntrinsicId),
}

/// The memory accessed by a use: a single location, or whatever a particular call accesses.
///
/// Two uses with equal keys are clobbered by exactly the same definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MemoryLocOrCall {
    Loc(MemoryLocation),
    Call {
        callee: Callee,
        args: SmallVec<[Value; 4]>,
    },
}

impl MemoryLocOrCall {
    fn of(func: &Function, inst: Inst) -> Option<Self> {
        match func.inst(inst) {
            InstData::Call { callee, args } => Some(Self::Call {
                callee: Callee::Function(*callee),
                args: args.clone(),
            }),
            InstData::Intrinsic { id, args } => Some(Self::Call {
                callee: Callee::Intrinsic(*id),
                args: args.iter().copied().collect(),
            }),
            _ => MemoryLocation::get(func, inst).map(Self::Loc),
        }
    }
}

/// What is known about the most recent queries for one [MemoryLocOrCall] during the use
/// optimization walk, used to avoid rechecking the same stack entries over and over.
#[derive(Debug, Default, Copy, Clone)]
struct MemlocStackInfo {
    /// The stack epoch at the time of the last query
    stack_epoch: u64,
    /// The pop epoch at the time of the last query
    pop_epoch: u64,
    /// Everything on the stack below this index is known not to clobber the location, down to
    /// `last_kill`
    lower_bound: usize,
    lower_bound_block: Option<Block>,
    /// The index of the last clobber found for the location
    last_kill: usize,
    last_kill_valid: bool,
}

/// Optimizes every use in the function in a single walk of the dominator tree.
///
/// The walk maintains a stack of the definitions (and phis) dominating the current position.
/// Each use is resolved by scanning that stack from the top, only as far down as the last query
/// for the same memory, and the result is cached as the clobbering access of the use. Phis on the
/// stack are resolved with a [CachingWalker].
pub(super) struct OptimizeUses<'a> {
    mssa: &'a MemorySsa,
    func: &'a Function,
    aa: &'a dyn AliasAnalysis,
    walker: CachingWalker<'a>,
}

impl<'a> OptimizeUses<'a> {
    pub fn new(mssa: &'a MemorySsa, func: &'a Function, aa: &'a dyn AliasAnalysis) -> Self {
        let mut walker = CachingWalker::new(mssa, func, aa);
        walker.set_auto_reset(false);
        Self {
            mssa,
            func,
            aa,
            walker,
        }
    }

    pub fn optimize_uses(mut self) {
        let mut version_stack = Vec::from([self.mssa.live_on_entry_def()]);
        let mut loc_stack_info = FxHashMap::<MemoryLocOrCall, MemlocStackInfo>::default();
        let mut stack_epoch = 1u64;
        let mut pop_epoch = 1u64;

        let domtree = self.mssa.domtree();
        for node in domtree.preorder() {
            let Some(block) = domtree.node(node).block() else {
                continue;
            };
            self.optimize_uses_in_block(
                block,
                &mut stack_epoch,
                &mut pop_epoch,
                &mut version_stack,
                &mut loc_stack_info,
            );
        }

        self.walker.reset_clobber_walker();
    }

    fn optimize_uses_in_block(
        &mut self,
        block: Block,
        stack_epoch: &mut u64,
        pop_epoch: &mut u64,
        version_stack: &mut Vec<MemoryAccessId>,
        loc_stack_info: &mut FxHashMap<MemoryLocOrCall, MemlocStackInfo>,
    ) {
        let mssa = self.mssa;
        let Some(accesses) = mssa.block_accesses(block) else {
            return;
        };

        // Pop everything that does not dominate this block off of the stack
        loop {
            let top = *version_stack.last().expect("live-on-entry is always on the stack");
            let top_block = mssa.access(top).block;
            if mssa.domtree().dominates(top_block, block) {
                break;
            }
            while version_stack
                .last()
                .is_some_and(|access| mssa.access(*access).block == top_block)
            {
                version_stack.pop();
            }
            *pop_epoch += 1;
        }

        for access in accesses.iter().copied() {
            let MemoryAccessKind::Use(use_) = &mssa.access(access).kind else {
                version_stack.push(access);
                *stack_epoch += 1;
                continue;
            };
            if use_.is_optimized() {
                continue;
            }
            let Some(inst) = use_.inst() else {
                continue;
            };

            if is_use_trivially_optimizable_to_live_on_entry(self.func, self.aa, inst) {
                mssa.set_optimized(access, mssa.live_on_entry_def());
                continue;
            }

            let Some(key) = MemoryLocOrCall::of(self.func, inst) else {
                continue;
            };
            let query = match &key {
                MemoryLocOrCall::Loc(loc) => UpwardsMemoryQuery {
                    is_call: false,
                    start_loc: Some(*loc),
                    inst: Some(inst),
                },
                MemoryLocOrCall::Call { .. } => UpwardsMemoryQuery {
                    is_call: true,
                    start_loc: None,
                    inst: Some(inst),
                },
            };
            let loc = query.start_loc;
            let info = loc_stack_info.entry(key).or_default();

            if info.pop_epoch != *pop_epoch {
                // Things were popped off the stack since the last query, the lower bound and last
                // kill may not be on the stack anymore
                info.pop_epoch = *pop_epoch;
                info.stack_epoch = *stack_epoch;
                if let Some(lower_bound_block) = info.lower_bound_block
                    && lower_bound_block != block
                    && !mssa.domtree().dominates(lower_bound_block, block)
                {
                    info.lower_bound = 0;
                    info.lower_bound_block = Some(mssa.access(version_stack[0]).block);
                    info.last_kill_valid = false;
                }
            } else if info.stack_epoch != *stack_epoch {
                // Only new things were pushed, everything below them has been checked already
                info.pop_epoch = *pop_epoch;
                info.stack_epoch = *stack_epoch;
            }

            if !info.last_kill_valid {
                info.last_kill = version_stack.len() - 1;
                info.last_kill_valid = true;
            }

            debug_assert!(info.lower_bound < version_stack.len());
            debug_assert!(info.last_kill < version_stack.len());

            let mut upper_bound = version_stack.len() - 1;
            if upper_bound - info.lower_bound > mssa.config().check_limit() {
                log::trace!(
                    target: "memssa:optimize-uses",
                    "{inst} needs to check {} definitions, more than the limit of {}",
                    upper_bound - info.lower_bound,
                    mssa.config().check_limit()
                );
                // Nothing was checked, so whatever clobbers this use may also kill the location
                info.last_kill_valid = false;
                info.lower_bound = version_stack.len() - 1;
                info.lower_bound_block = Some(block);
                continue;
            }

            let mut found_clobber = false;
            while upper_bound > info.lower_bound {
                let candidate = version_stack[upper_bound];
                match &mssa.access(candidate).kind {
                    MemoryAccessKind::Phi(_) => {
                        // Let the walker figure out phis, then resume from wherever it ended up
                        let clobber = self.walker.clobbering_access(access);
                        match version_stack[..=upper_bound].iter().rposition(|a| *a == clobber) {
                            Some(index) => upper_bound = index,
                            None => {
                                debug_assert!(false, "{clobber} is not on the version stack");
                                info.last_kill_valid = false;
                                break;
                            }
                        }
                        found_clobber = true;
                        break;
                    }
                    MemoryAccessKind::Def(def) => {
                        if lifetime_ends_at(self.func, self.aa, def.inst(), loc.as_ref()) {
                            // The location is dead above the end of its lifetime
                            upper_bound = 0;
                            found_clobber = true;
                            break;
                        }
                        if instruction_clobbers_query(
                            mssa,
                            self.func,
                            self.aa,
                            candidate,
                            loc.as_ref(),
                            &query,
                        ) {
                            found_clobber = true;
                            break;
                        }
                    }
                    MemoryAccessKind::Use(_) => unreachable!("uses are never on the version stack"),
                }
                upper_bound -= 1;
            }

            if !info.last_kill_valid {
                // The walker found a clobber which is not on the stack
                mssa.reset_optimized(access);
                continue;
            }

            if found_clobber || upper_bound < info.last_kill {
                mssa.set_optimized(access, version_stack[upper_bound]);
                info.last_kill = upper_bound;
            } else {
                // Everything new was checked, and none of it clobbers, so the last kill still
                // stands
                mssa.set_optimized(access, version_stack[info.last_kill]);
            }
            info.lower_bound = version_stack.len() - 1;
            info.lower_bound_block = Some(block);
        }
    }
}

/// Returns true if `def` ends the lifetime of the memory at `loc`
fn lifetime_ends_at(
    func: &Function,
    aa: &dyn AliasAnalysis,
    def: Option<Inst>,
    loc: Option<&MemoryLocation>,
) -> bool {
    let (Some(def), Some(loc)) = (def, loc) else {
        return false;
    };
    if func.inst(def).intrinsic_id() != Some(IntrinsicId::LifetimeEnd) {
        return false;
    }
    MemoryLocation::for_arg(func, def, 0).is_some_and(|ptr| aa.is_must_alias(func, &ptr, loc))
}
