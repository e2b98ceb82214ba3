use memssa_ir::{Function, Inst, InstData, MemFlags};

use super::{
    MemoryAccessId, MemorySsa,
    walker::{ClobberWalker, UpwardsMemoryQuery},
};
use crate::{AliasAnalysis, MemoryLocation};

/// The query interface to clobbering accesses.
///
/// Every query returns an access which dominates the queried one, and such that no definition on
/// any path between the two may clobber the memory in question. Queries never fail: when nothing
/// better is known, the answer is conservative.
pub trait MemorySsaWalker {
    /// Find the nearest access which may clobber the memory accessed by `access`.
    ///
    /// Phis are their own clobbering access.
    fn clobbering_access(&mut self, access: MemoryAccessId) -> MemoryAccessId;

    /// Find the nearest access at or above `access` which may clobber `loc`.
    ///
    /// Unlike [Self::clobbering_access], a definition is considered as a candidate clobber of
    /// `loc` itself, and nothing is cached.
    fn clobbering_access_for_location(
        &mut self,
        access: MemoryAccessId,
        loc: &MemoryLocation,
    ) -> MemoryAccessId;

    /// Forget anything cached about `access`
    fn invalidate_info(&mut self, access: MemoryAccessId) {
        let _ = access;
    }
}

/// Returns true if the load `inst` can never be clobbered, because the memory it reads is
/// constant, or known to never change
pub(crate) fn is_use_trivially_optimizable_to_live_on_entry(
    func: &Function,
    aa: &dyn AliasAnalysis,
    inst: Inst,
) -> bool {
    let InstData::Load { flags, .. } = func.inst(inst) else {
        return false;
    };
    flags.contains(MemFlags::INVARIANT)
        || MemoryLocation::get(func, inst)
            .is_some_and(|loc| aa.points_to_constant_memory(func, &loc, false))
}

/// A walker which caches the clobbering access of each use or definition it is asked about
/// in that access, so that repeated queries are answered without walking.
///
/// The cache of an access is reset whenever its defining access changes, or it is moved, and
/// whenever the access it refers to is removed.
pub struct CachingWalker<'a> {
    mssa: &'a MemorySsa,
    func: &'a Function,
    aa: &'a dyn AliasAnalysis,
    walker: ClobberWalker<'a>,
    /// Whether to free the walker's scratch buffers after every query
    auto_reset: bool,
}

impl<'a> CachingWalker<'a> {
    pub fn new(mssa: &'a MemorySsa, func: &'a Function, aa: &'a dyn AliasAnalysis) -> Self {
        Self {
            mssa,
            func,
            aa,
            walker: ClobberWalker::new(mssa, func, aa),
            auto_reset: true,
        }
    }

    /// Set whether the scratch buffers of the underlying walker are freed after each query.
    ///
    /// The path state of a query never carries over to the next one either way. Keeping the
    /// buffers avoids reallocating them when answering many queries in a row, in which case
    /// [Self::reset_clobber_walker] should be called once done.
    pub fn set_auto_reset(&mut self, yes: bool) -> &mut Self {
        self.auto_reset = yes;
        self
    }

    #[inline]
    pub fn auto_reset(&self) -> bool {
        self.auto_reset
    }

    /// Free the scratch buffers of the underlying walker
    pub fn reset_clobber_walker(&mut self) {
        self.walker.release();
    }

    /// Returns true if the underlying walker is holding on to scratch buffers
    pub fn holds_scratch(&self) -> bool {
        self.walker.holds_scratch()
    }

    fn finish_query(&mut self) {
        if self.auto_reset {
            self.walker.release();
        }
    }
}

impl MemorySsaWalker for CachingWalker<'_> {
    fn clobbering_access(&mut self, access: MemoryAccessId) -> MemoryAccessId {
        let mssa = self.mssa;
        let Some(use_or_def) = mssa.access(access).as_use_or_def() else {
            return access;
        };
        let Some(inst) = use_or_def.inst() else {
            // The live-on-entry definition
            return access;
        };

        if let Some(optimized) = use_or_def.optimized() {
            return optimized;
        }

        // A fence clobbers all of memory, and has no location to disambiguate against
        if self.func.inst(inst).is_fence() {
            return access;
        }

        let live_on_entry = mssa.live_on_entry_def();
        if is_use_trivially_optimizable_to_live_on_entry(self.func, self.aa, inst) {
            mssa.set_optimized(access, live_on_entry);
            return live_on_entry;
        }

        let defining = use_or_def.defining_access().unwrap_or(live_on_entry);
        // Nothing is above the state on entry
        if mssa.is_live_on_entry_def(defining) {
            mssa.set_optimized(access, defining);
            return defining;
        }

        let query = UpwardsMemoryQuery::for_inst(self.func, inst);
        let clobber = self.walker.find_clobber(defining, &query);
        mssa.set_optimized(access, clobber);
        self.finish_query();
        clobber
    }

    fn clobbering_access_for_location(
        &mut self,
        access: MemoryAccessId,
        loc: &MemoryLocation,
    ) -> MemoryAccessId {
        let mssa = self.mssa;
        let Some(use_or_def) = mssa.access(access).as_use_or_def() else {
            return access;
        };
        let Some(inst) = use_or_def.inst() else {
            return access;
        };
        if self.func.inst(inst).is_fence() {
            return access;
        }

        // The access itself is a candidate, unless it only reads memory
        let query = UpwardsMemoryQuery::for_location(*loc);
        let clobber = self.walker.find_clobber(access, &query);
        self.finish_query();
        clobber
    }

    fn invalidate_info(&mut self, access: MemoryAccessId) {
        self.mssa.reset_optimized(access);
    }
}

/// A walker which does no work at all: the clobbering access of a use or definition is taken to
/// be its defining access.
///
/// This is always a correct, if imprecise, answer.
pub struct DoNothingWalker<'a> {
    mssa: &'a MemorySsa,
}

impl<'a> DoNothingWalker<'a> {
    pub fn new(mssa: &'a MemorySsa) -> Self {
        Self { mssa }
    }
}

impl MemorySsaWalker for DoNothingWalker<'_> {
    fn clobbering_access(&mut self, access: MemoryAccessId) -> MemoryAccessId {
        self.mssa.access(access).defining_access().unwrap_or(access)
    }

    fn clobbering_access_for_location(
        &mut self,
        access: MemoryAccessId,
        _loc: &MemoryLocation,
    ) -> MemoryAccessId {
        if self.mssa.access(access).is_use() {
            self.clobbering_access(access)
        } else {
            access
        }
    }
}
