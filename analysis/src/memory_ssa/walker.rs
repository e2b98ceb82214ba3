//! The clobber walker: an upward search of the Memory SSA graph for the nearest access which may
//! write the memory observed by a query.
//!
//! Starting from a definition, the walker follows the chain of defining accesses until it either
//! finds a definition which clobbers the query location, or reaches a phi. At a phi the search
//! forks along every incoming edge, and the walker tries to *optimize the phi* away: if every path
//! out of the phi reaches a clobber which dominates the phi, or reaches the nearest dominating
//! definition of the phi without being clobbered, the search can continue from there as if the
//! phi had not been present. When some path is blocked by a clobber which does not dominate the
//! phi, the phi itself is the answer.
use alloc::vec::Vec;

use memssa_ir::{AtomicOrdering, Function, FxHashSet, Inst, InstData, IntrinsicId, MemFlags};
use smallvec::SmallVec;

use super::{MemoryAccessId, MemoryAccessKind, MemorySsa};
use crate::{AliasAnalysis, MemoryLocation};

/// What a walk is looking for clobbers of
#[derive(Debug, Copy, Clone)]
pub(crate) struct UpwardsMemoryQuery {
    /// Whether the query instruction is a call, in which case there is no single location
    pub is_call: bool,
    pub start_loc: Option<MemoryLocation>,
    /// The instruction being queried, `None` for a query about an explicit location
    pub inst: Option<Inst>,
}

impl UpwardsMemoryQuery {
    /// A query for the memory accessed by `inst`
    pub fn for_inst(func: &Function, inst: Inst) -> Self {
        let is_call = func.inst(inst).is_call();
        let start_loc = if is_call {
            None
        } else {
            MemoryLocation::get(func, inst)
        };
        Self {
            is_call,
            start_loc,
            inst: Some(inst),
        }
    }

    /// A query for `loc`, independent of any instruction
    pub fn for_location(loc: MemoryLocation) -> Self {
        Self {
            is_call: false,
            start_loc: Some(loc),
            inst: None,
        }
    }
}

/// Whether two loads may be reordered with respect to one another
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Reorderability {
    Always,
    IfNoAlias,
    Never,
}

/// Determine whether the load `use_inst` may be moved above the load `clobber_inst`
fn load_reorderability(func: &Function, use_inst: Inst, clobber_inst: Inst) -> Reorderability {
    let (
        InstData::Load {
            flags: use_flags,
            ordering: use_ordering,
            ..
        },
        InstData::Load {
            flags: clobber_flags,
            ordering: clobber_ordering,
            ..
        },
    ) = (func.inst(use_inst), func.inst(clobber_inst))
    else {
        return Reorderability::Never;
    };

    let volatile_use = use_flags.contains(MemFlags::VOLATILE);
    let volatile_clobber = clobber_flags.contains(MemFlags::VOLATILE);
    if volatile_use && volatile_clobber {
        return Reorderability::Never;
    }

    // A sequentially consistent load cannot move above any other load, and nothing may move
    // above an acquire
    let seq_cst_use = *use_ordering == AtomicOrdering::SequentiallyConsistent;
    let acquire_clobber = clobber_ordering.is_at_least_or_stronger_than(AtomicOrdering::Acquire);
    if seq_cst_use || acquire_clobber {
        return Reorderability::Never;
    }

    if volatile_use || volatile_clobber {
        Reorderability::IfNoAlias
    } else {
        Reorderability::Always
    }
}

/// Returns true if the definition `def` may clobber what `query` observes at `loc`.
///
/// `loc` is the location of the query along the path being walked, and is ignored for call
/// queries.
pub(crate) fn instruction_clobbers_query(
    mssa: &MemorySsa,
    func: &Function,
    aa: &dyn AliasAnalysis,
    def: MemoryAccessId,
    loc: Option<&MemoryLocation>,
    query: &UpwardsMemoryQuery,
) -> bool {
    let Some(def_inst) = mssa.access(def).inst() else {
        // The state on entry clobbers everything
        return true;
    };
    let def_data = func.inst(def_inst);

    if let Some(id) = def_data.intrinsic_id() {
        match id {
            IntrinsicId::LifetimeStart => {
                // Memory whose lifetime starts here is undefined above it
                if query.is_call {
                    return false;
                }
                let (Some(ptr_loc), Some(loc)) = (MemoryLocation::for_arg(func, def_inst, 0), loc)
                else {
                    return false;
                };
                return aa.is_must_alias(func, &ptr_loc, loc);
            }
            IntrinsicId::LifetimeEnd
            | IntrinsicId::InvariantStart
            | IntrinsicId::InvariantEnd
            | IntrinsicId::Assume => return false,
        }
    }

    if query.is_call {
        let Some(call) = query.inst else {
            return true;
        };
        return aa.mod_ref_info_for_call(func, def_inst, call).is_mod_or_ref();
    }

    let Some(loc) = loc else {
        return true;
    };

    if let Some(use_inst) = query.inst
        && matches!(def_data, InstData::Load { .. })
        && matches!(func.inst(use_inst), InstData::Load { .. })
    {
        return match load_reorderability(func, use_inst, def_inst) {
            Reorderability::Always => false,
            Reorderability::Never => true,
            Reorderability::IfNoAlias => {
                let def_loc = MemoryLocation::get(func, def_inst);
                def_loc.is_none_or(|def_loc| !aa.is_no_alias(func, &def_loc, loc))
            }
        };
    }

    aa.mod_ref_info_for_location(func, def_inst, loc).is_mod()
}

/// A segment of a search path: the walk of `loc` from `first` up to `last`.
///
/// Paths form a tree through `previous`, each path starting at an incoming value of the phi
/// which ended the previous one.
#[derive(Debug, Copy, Clone)]
struct DefPath {
    loc: Option<MemoryLocation>,
    first: MemoryAccessId,
    last: MemoryAccessId,
    previous: Option<usize>,
}

#[derive(Debug, Copy, Clone)]
struct UpwardsWalkResult {
    /// The clobber, or the phi at which the walk stopped
    result: MemoryAccessId,
    is_known_clobber: bool,
}

/// A search path which ended at a clobber
#[derive(Debug, Copy, Clone)]
struct TerminatedPath {
    clobber: MemoryAccessId,
    last_node: usize,
}

/// Walks the Memory SSA graph upwards to find clobbering accesses.
///
/// The walker owns scratch buffers for phi optimization. Their contents are cleared before every
/// query, but their storage is kept until [ClobberWalker::release] is called.
pub(crate) struct ClobberWalker<'a> {
    mssa: &'a MemorySsa,
    func: &'a Function,
    aa: &'a dyn AliasAnalysis,
    paths: Vec<DefPath>,
    visited_phis: FxHashSet<(MemoryAccessId, Option<MemoryLocation>)>,
}

impl<'a> ClobberWalker<'a> {
    pub fn new(mssa: &'a MemorySsa, func: &'a Function, aa: &'a dyn AliasAnalysis) -> Self {
        Self {
            mssa,
            func,
            aa,
            paths: Vec::new(),
            visited_phis: FxHashSet::default(),
        }
    }

    /// Forget the phi optimization state of the last query, keeping the storage for the next one
    fn clear(&mut self) {
        self.paths.clear();
        self.visited_phis.clear();
    }

    /// Free the scratch buffers
    pub fn release(&mut self) {
        self.paths = Vec::new();
        self.visited_phis = FxHashSet::default();
    }

    /// Returns true if the scratch buffers currently own any storage
    pub fn holds_scratch(&self) -> bool {
        self.paths.capacity() > 0 || self.visited_phis.capacity() > 0
    }

    /// Find the clobbering access of `query`, starting the search at `start`.
    ///
    /// If `start` is a use, the search starts at its defining access instead. The result is
    /// either a definition which clobbers the query, or a phi that could not be optimized.
    pub fn find_clobber(
        &mut self,
        start: MemoryAccessId,
        query: &UpwardsMemoryQuery,
    ) -> MemoryAccessId {
        let mut current = start;
        if let MemoryAccessKind::Use(access) = &self.mssa.access(start).kind {
            current = access.defining.expect("memory use without a defining access");
        }

        self.clear();

        let mut first = DefPath {
            loc: query.start_loc,
            first: current,
            last: current,
            previous: None,
        };
        let walk = self.walk_to_phi_or_clobber(&mut first, query, None);
        let result = if walk.is_known_clobber {
            walk.result
        } else {
            self.try_optimize_phi(first.last, current, query.start_loc, query)
        };

        if cfg!(any(test, feature = "expensive-checks"))
            || self.mssa.config().should_verify_clobbers()
        {
            self.check_clobber_sanity(current, result, query.start_loc, query);
        }

        log::trace!(target: "memssa:walker", "clobber of {query:?} from {start} is {result}");
        result
    }

    fn clobbers(
        &self,
        def: MemoryAccessId,
        loc: Option<&MemoryLocation>,
        query: &UpwardsMemoryQuery,
    ) -> bool {
        instruction_clobbers_query(self.mssa, self.func, self.aa, def, loc, query)
    }

    /// Follow the defining accesses from `desc.last` until reaching a clobber, a phi, or
    /// `stop_at`, updating `desc.last` along the way
    fn walk_to_phi_or_clobber(
        &self,
        desc: &mut DefPath,
        query: &UpwardsMemoryQuery,
        stop_at: Option<MemoryAccessId>,
    ) -> UpwardsWalkResult {
        let mut current = Some(desc.last);
        while let Some(access) = current {
            desc.last = access;
            if Some(access) == stop_at {
                return UpwardsWalkResult {
                    result: access,
                    is_known_clobber: false,
                };
            }

            match &self.mssa.access(access).kind {
                MemoryAccessKind::Def(def) => {
                    if self.mssa.is_live_on_entry_def(access)
                        || self.clobbers(access, desc.loc.as_ref(), query)
                    {
                        return UpwardsWalkResult {
                            result: access,
                            is_known_clobber: true,
                        };
                    }
                    current = def.defining;
                }
                MemoryAccessKind::Use(_) => panic!("uses are never on a chain of definitions"),
                MemoryAccessKind::Phi(_) => break,
            }
        }

        assert!(
            self.mssa.access(desc.last).is_phi(),
            "walk ended at a non-clobber that is not a phi"
        );
        UpwardsWalkResult {
            result: desc.last,
            is_known_clobber: false,
        }
    }

    /// Start a new path from each reachable incoming value of `phi`, continuing the path `prior`
    fn add_searches(
        &mut self,
        phi: MemoryAccessId,
        paused: &mut SmallVec<[usize; 16]>,
        prior: usize,
    ) {
        let loc = self.paths[prior].loc;
        let Some(phi) = self.mssa.access(phi).as_phi() else {
            panic!("{phi} is not a memory phi");
        };
        for (pred, value) in phi.incoming().iter().copied() {
            // Memory flowing in from an unreachable block can never be observed
            if !self.mssa.domtree().is_reachable_from_entry(pred) {
                continue;
            }
            paused.push(self.paths.len());
            self.paths.push(DefPath {
                loc,
                first: value,
                last: value,
                previous: Some(prior),
            });
        }
    }

    /// Continue each of the `paused` searches until it reaches `stop_where`, a clobber, or
    /// revisits a phi.
    ///
    /// Searches which reach `stop_where` are moved to `new_paused`, and searches ending at a
    /// clobber which dominates `stop_where` are recorded in `terminated`. A search ending at a
    /// clobber which does not dominate `stop_where` blocks the phi optimization, and is returned.
    fn get_blocking_access(
        &mut self,
        stop_where: MemoryAccessId,
        paused: &mut SmallVec<[usize; 16]>,
        new_paused: &mut SmallVec<[usize; 8]>,
        terminated: &mut SmallVec<[TerminatedPath; 4]>,
        query: &UpwardsMemoryQuery,
    ) -> Option<TerminatedPath> {
        while let Some(index) = paused.pop() {
            let mut node = self.paths[index];
            // There is nothing to learn from walking the same access for the same location twice
            if !self.visited_phis.insert((node.last, node.loc)) {
                continue;
            }

            let walk = self.walk_to_phi_or_clobber(&mut node, query, Some(stop_where));
            self.paths[index] = node;

            if walk.is_known_clobber {
                let path = TerminatedPath {
                    clobber: walk.result,
                    last_node: index,
                };
                if !self.mssa.dominates(walk.result, stop_where) {
                    return Some(path);
                }
                terminated.push(path);
                continue;
            }

            if walk.result == stop_where {
                new_paused.push(index);
                continue;
            }

            self.add_searches(walk.result, paused, index);
        }

        None
    }

    /// The access the search continues from when optimizing `phi`: the last definition of the
    /// nearest dominating block which has one
    fn walk_target(&self, phi: MemoryAccessId) -> MemoryAccessId {
        let domtree = self.mssa.domtree();
        let mut node = domtree.node_id(self.mssa.access(phi).block);
        while let Some(idom) = node.and_then(|node| domtree.node(node).idom()) {
            if let Some(block) = domtree.node(idom).block()
                && let Some(last) = self.mssa.block_defs(block).and_then(|defs| defs.last())
            {
                return *last;
            }
            node = Some(idom);
        }
        self.mssa.live_on_entry_def()
    }

    /// The phi or live-on-entry definition at the end of the chain of definitions from `access`
    fn def_chain_end(&self, mut access: MemoryAccessId) -> MemoryAccessId {
        loop {
            match &self.mssa.access(access).kind {
                MemoryAccessKind::Def(def) | MemoryAccessKind::Use(def) => match def.defining {
                    Some(defining) => access = defining,
                    None => return access,
                },
                MemoryAccessKind::Phi(_) => return access,
            }
        }
    }

    /// The index of the path whose clobber is dominated by every other clobber in `paths`
    fn most_dominated(&self, paths: &[TerminatedPath]) -> usize {
        let mut dominated = 0;
        for (index, path) in paths.iter().enumerate().skip(1) {
            if !self.mssa.dominates(path.clobber, paths[dominated].clobber) {
                dominated = index;
            }
        }
        dominated
    }

    /// Try to find a clobber for `loc` above `phi`, given that the walk from `start` reached it
    fn try_optimize_phi(
        &mut self,
        phi: MemoryAccessId,
        start: MemoryAccessId,
        loc: Option<MemoryLocation>,
        query: &UpwardsMemoryQuery,
    ) -> MemoryAccessId {
        debug_assert!(self.paths.is_empty() && self.visited_phis.is_empty());

        self.paths.push(DefPath {
            loc,
            first: start,
            last: phi,
            previous: None,
        });
        // The number of paths which existed before the latest round of searches
        let mut prior_paths_size = self.paths.len();

        let mut paused = SmallVec::<[usize; 16]>::new();
        let mut new_paused = SmallVec::<[usize; 8]>::new();
        let mut terminated = SmallVec::<[TerminatedPath; 4]>::new();
        self.add_searches(phi, &mut paused, 0);

        let mut current = phi;
        loop {
            let target = self.walk_target(current);

            if let Some(blocker) =
                self.get_blocking_access(target, &mut paused, &mut new_paused, &mut terminated, query)
            {
                // Answer with the phi that started the round which ran into the blocker
                let mut index = blocker.last_node;
                while index >= prior_paths_size {
                    index = self.paths[index]
                        .previous
                        .expect("every search started in this round continues an older path");
                }
                let start_node = self.paths[index];
                debug_assert_eq!(start_node.last, current);
                log::trace!(
                    target: "memssa:walker",
                    "phi {current} is blocked by {} along the path from {}",
                    blocker.clobber,
                    start_node.first
                );
                return start_node.last;
            }

            // Every path led to a clobber dominating the target, pick the nearest one
            if new_paused.is_empty() {
                let dominated = self.most_dominated(&terminated);
                return terminated[dominated].clobber;
            }

            let mut def_chain_end = None;
            let mut clobbers = SmallVec::<[TerminatedPath; 4]>::new();
            for index in new_paused.iter().copied() {
                let mut node = self.paths[index];
                let walk = self.walk_to_phi_or_clobber(&mut node, query, None);
                self.paths[index] = node;
                if walk.is_known_clobber {
                    clobbers.push(TerminatedPath {
                        clobber: walk.result,
                        last_node: index,
                    });
                } else {
                    def_chain_end = Some(walk.result);
                }
            }

            if !terminated.is_empty() {
                let end = def_chain_end.unwrap_or_else(|| self.def_chain_end(target));
                def_chain_end = Some(end);
                // Nothing can be above `end` on every path, so block dominance is enough
                let chain_block = self.mssa.access(end).block;
                for path in terminated.iter().copied() {
                    let clobber_block = self.mssa.access(path.clobber).block;
                    if self.mssa.domtree().dominates(chain_block, clobber_block) {
                        clobbers.push(path);
                    }
                }
            }

            if !clobbers.is_empty() {
                let dominated = self.most_dominated(&clobbers);
                return clobbers[dominated].clobber;
            }

            // The live-on-entry definition is a clobber, so the chain must have ended at a phi
            let next_phi = def_chain_end.expect("paused searches always reach the end of the chain");
            assert!(self.mssa.access(next_phi).is_phi(), "{next_phi} should be a phi");

            prior_paths_size = self.paths.len();
            paused.clear();
            for index in new_paused.drain(..) {
                self.add_searches(next_phi, &mut paused, index);
            }
            current = next_phi;
        }
    }

    /// Check that `clobber_at` is a valid answer for a walk from `start`: it dominates `start`,
    /// nothing on any path between the two clobbers the query, and `clobber_at` itself does (or
    /// is a phi).
    fn check_clobber_sanity(
        &self,
        start: MemoryAccessId,
        clobber_at: MemoryAccessId,
        start_loc: Option<MemoryLocation>,
        query: &UpwardsMemoryQuery,
    ) {
        let mssa = self.mssa;
        assert!(mssa.dominates(clobber_at, start), "clobber {clobber_at} does not dominate {start}");

        if mssa.is_live_on_entry_def(start) {
            assert!(mssa.is_live_on_entry_def(clobber_at), "live-on-entry must clobber itself");
            return;
        }

        let mut found_clobber = false;
        let mut visited = FxHashSet::<(MemoryAccessId, Option<MemoryLocation>)>::default();
        let mut worklist = SmallVec::<[(MemoryAccessId, Option<MemoryLocation>); 8]>::new();
        worklist.push((start, start_loc));

        while let Some((from, loc)) = worklist.pop() {
            if !visited.insert((from, loc)) {
                continue;
            }

            let mut current = Some(from);
            while let Some(access) = current {
                if access == clobber_at {
                    if mssa.access(access).is_def() {
                        found_clobber = found_clobber
                            || mssa.is_live_on_entry_def(access)
                            || self.clobbers(access, loc.as_ref(), query);
                    }
                    break;
                }

                assert!(
                    !mssa.is_live_on_entry_def(access),
                    "hit live-on-entry before reaching the clobber {clobber_at}"
                );

                match &mssa.access(access).kind {
                    MemoryAccessKind::Def(def) => {
                        assert!(
                            access == start || !self.clobbers(access, loc.as_ref(), query),
                            "found clobber {access} before reaching {clobber_at}"
                        );
                        current = def.defining;
                    }
                    MemoryAccessKind::Use(use_) => {
                        assert_eq!(access, start, "only the start of a walk can be a use");
                        current = use_.defining;
                    }
                    MemoryAccessKind::Phi(phi) => {
                        for (pred, value) in phi.incoming().iter().copied() {
                            if mssa.domtree().is_reachable_from_entry(pred) {
                                worklist.push((value, loc));
                            }
                        }
                        current = None;
                    }
                }
            }
        }

        assert!(
            mssa.access(clobber_at).is_phi() || found_clobber,
            "{clobber_at} never acted as a clobber"
        );
    }
}

impl MemorySsa {
    /// Returns true if the definition `def` may clobber the memory accessed by `use_or_def`
    pub fn def_clobbers_use_or_def(
        &self,
        func: &Function,
        aa: &dyn AliasAnalysis,
        def: MemoryAccessId,
        use_or_def: MemoryAccessId,
    ) -> bool {
        assert!(self.access(def).is_def(), "{def} is not a memory definition");
        let Some(inst) = self.access(use_or_def).inst() else {
            return true;
        };
        let query = UpwardsMemoryQuery::for_inst(func, inst);
        instruction_clobbers_query(self, func, aa, def, query.start_loc.as_ref(), &query)
    }
}
