//! Alias analysis interfaces consumed by Memory SSA.
//!
//! Memory SSA never reasons about pointers itself. Every question of the form "may these two
//! accesses touch the same bytes" or "what does this instruction do to memory" is delegated to an
//! implementation of [AliasAnalysis]. [AAResults] chains several implementations together, and
//! [BasicAliasAnalysis] provides a cheap, local reasoning about the objects underlying pointers.
mod basic;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use memssa_ir::{Function, Inst, InstData, IntrinsicId, ModRefBehavior, Value};

pub use self::basic::BasicAliasAnalysis;

/// The number of bytes covered by a [MemoryLocation]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LocationSize {
    Precise(u64),
    /// The access may cover any number of bytes at or after its pointer
    Unknown,
}

impl LocationSize {
    #[inline]
    pub fn value(self) -> Option<u64> {
        match self {
            Self::Precise(size) => Some(size),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for LocationSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precise(size) => write!(f, "{size}"),
            Self::Unknown => f.write_str("?"),
        }
    }
}

/// A range of memory, identified by its starting address and its size
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemoryLocation {
    pub ptr: Value,
    pub size: LocationSize,
}

impl MemoryLocation {
    #[inline]
    pub const fn new(ptr: Value, size: LocationSize) -> Self {
        Self { ptr, size }
    }

    #[inline]
    pub const fn precise(ptr: Value, size: u64) -> Self {
        Self::new(ptr, LocationSize::Precise(size))
    }

    /// The location accessed by `inst`, if it is a load or store
    pub fn get(func: &Function, inst: Inst) -> Option<Self> {
        match func.inst(inst) {
            InstData::Load { ptr, size, .. } | InstData::Store { ptr, size, .. } => {
                Some(Self::precise(*ptr, *size))
            }
            _ => None,
        }
    }

    /// The memory reachable through the `index`th argument of the call `inst`.
    ///
    /// Nothing is known about how much of that memory is accessed, so the size is unknown.
    pub fn for_arg(func: &Function, inst: Inst, index: usize) -> Option<Self> {
        match func.inst(inst) {
            InstData::Call { args, .. } => args.get(index),
            InstData::Intrinsic { args, .. } => args.get(index),
            _ => None,
        }
        .map(|ptr| Self::new(*ptr, LocationSize::Unknown))
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.ptr, self.size)
    }
}

/// The possible results of an alias query
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AliasResult {
    /// The two locations do not overlap
    NoAlias,
    /// Nothing is known about the relationship of the two locations
    MayAlias,
    /// The two locations are known to overlap, but do not start at the same address
    PartialAlias,
    /// The two locations start at the same address
    MustAlias,
}

bitflags::bitflags! {
    /// Whether an operation may read (`REF`) and/or write (`MOD`) some memory
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ModRefInfo: u8 {
        const REF = 1;
        const MOD = 1 << 1;
        const MOD_REF = Self::REF.bits() | Self::MOD.bits();
    }
}

impl ModRefInfo {
    /// The operation neither reads nor writes the memory in question
    pub const NO_MOD_REF: Self = Self::empty();

    #[inline]
    pub fn is_mod(self) -> bool {
        self.contains(Self::MOD)
    }

    #[inline]
    pub fn is_ref(self) -> bool {
        self.contains(Self::REF)
    }

    #[inline]
    pub fn is_mod_or_ref(self) -> bool {
        !self.is_empty()
    }
}

impl Default for ModRefInfo {
    fn default() -> Self {
        Self::NO_MOD_REF
    }
}

/// An alias oracle.
///
/// Only [AliasAnalysis::alias] is required, everything else is derived from it and from the
/// instruction kinds, but implementations with more knowledge may override any query. Every
/// answer must be conservative: when in doubt, report that memory may alias, or may be modified.
pub trait AliasAnalysis {
    /// Determine how the locations `a` and `b` relate
    fn alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult;

    /// Returns true if `loc` is known to only refer to memory which is never written.
    ///
    /// When `or_local` is set, function-local memory is treated as constant as well.
    fn points_to_constant_memory(
        &self,
        func: &Function,
        loc: &MemoryLocation,
        or_local: bool,
    ) -> bool {
        let _ = (func, loc, or_local);
        false
    }

    /// Summarize the memory behavior of the call `call`
    fn mod_ref_behavior(&self, func: &Function, call: Inst) -> ModRefBehavior {
        declared_behavior(func, call)
    }

    /// The effect of `inst` on memory in general
    fn mod_ref_info(&self, func: &Function, inst: Inst) -> ModRefInfo {
        mod_ref_info_generic(self, func, inst)
    }

    /// The effect of `inst` on the memory at `loc`
    fn mod_ref_info_for_location(
        &self,
        func: &Function,
        inst: Inst,
        loc: &MemoryLocation,
    ) -> ModRefInfo {
        mod_ref_info_for_location_generic(self, func, inst, loc)
    }

    /// The effect of `inst` on the memory accessed by the call `call`
    fn mod_ref_info_for_call(&self, func: &Function, inst: Inst, call: Inst) -> ModRefInfo {
        mod_ref_info_for_call_generic(self, func, inst, call)
    }

    #[inline]
    fn is_no_alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> bool {
        self.alias(func, a, b) == AliasResult::NoAlias
    }

    #[inline]
    fn is_must_alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> bool {
        self.alias(func, a, b) == AliasResult::MustAlias
    }
}

/// The behavior of a call as declared by its callee
fn declared_behavior(func: &Function, call: Inst) -> ModRefBehavior {
    match func.inst(call) {
        InstData::Call { callee, .. } => func.ext_funcs[*callee].behavior,
        InstData::Intrinsic { .. } => ModRefBehavior::OnlyAccessesArgumentPointees,
        _ => ModRefBehavior::DoesNotAccessMemory,
    }
}

fn mod_ref_info_generic<A>(aa: &A, func: &Function, inst: Inst) -> ModRefInfo
where
    A: AliasAnalysis + ?Sized,
{
    let data = func.inst(inst);
    match data {
        InstData::Load { .. } if data.is_ordered_access() => ModRefInfo::MOD_REF,
        InstData::Load { .. } => ModRefInfo::REF,
        InstData::Store { .. } if data.is_ordered_access() => ModRefInfo::MOD_REF,
        InstData::Store { .. } => ModRefInfo::MOD,
        InstData::Fence { .. } => ModRefInfo::MOD_REF,
        // Assumptions are modeled as reading and writing memory
        InstData::Intrinsic {
            id: IntrinsicId::Assume,
            ..
        } => ModRefInfo::MOD_REF,
        InstData::Intrinsic { .. } => ModRefInfo::MOD,
        InstData::Call { .. } => behavior_mod_ref(aa.mod_ref_behavior(func, inst)),
        _ => ModRefInfo::NO_MOD_REF,
    }
}

fn mod_ref_info_for_location_generic<A>(
    aa: &A,
    func: &Function,
    inst: Inst,
    loc: &MemoryLocation,
) -> ModRefInfo
where
    A: AliasAnalysis + ?Sized,
{
    let data = func.inst(inst);
    match data {
        // Be conservative in the face of atomic and volatile accesses
        InstData::Load { .. } | InstData::Store { .. } if data.is_ordered_access() => {
            ModRefInfo::MOD_REF
        }
        InstData::Load { ptr, size, .. } => {
            if aa.is_no_alias(func, &MemoryLocation::precise(*ptr, *size), loc) {
                ModRefInfo::NO_MOD_REF
            } else {
                ModRefInfo::REF
            }
        }
        InstData::Store { ptr, size, .. } => {
            if aa.is_no_alias(func, &MemoryLocation::precise(*ptr, *size), loc)
                || aa.points_to_constant_memory(func, loc, false)
            {
                ModRefInfo::NO_MOD_REF
            } else {
                ModRefInfo::MOD
            }
        }
        InstData::Fence { .. } => ModRefInfo::MOD_REF,
        InstData::Intrinsic {
            id: IntrinsicId::Assume,
            ..
        } => ModRefInfo::NO_MOD_REF,
        InstData::Intrinsic { args, .. } => {
            let touches = args.first().is_some_and(|ptr| {
                !aa.is_no_alias(func, &MemoryLocation::new(*ptr, LocationSize::Unknown), loc)
            });
            if touches {
                ModRefInfo::MOD
            } else {
                ModRefInfo::NO_MOD_REF
            }
        }
        InstData::Call { args, .. } => {
            let behavior = aa.mod_ref_behavior(func, inst);
            let mut result = behavior_mod_ref(behavior);
            if result.is_empty() {
                return result;
            }
            if behavior.only_accesses_arg_pointees() {
                let touches = args.iter().any(|arg| {
                    !aa.is_no_alias(func, &MemoryLocation::new(*arg, LocationSize::Unknown), loc)
                });
                if !touches {
                    return ModRefInfo::NO_MOD_REF;
                }
            }
            if aa.points_to_constant_memory(func, loc, false) {
                result &= ModRefInfo::REF;
            }
            result
        }
        _ => ModRefInfo::NO_MOD_REF,
    }
}

fn mod_ref_info_for_call_generic<A>(aa: &A, func: &Function, inst: Inst, call: Inst) -> ModRefInfo
where
    A: AliasAnalysis + ?Sized,
{
    let data = func.inst(inst);
    if data.is_fence() {
        return ModRefInfo::MOD_REF;
    }

    if !data.is_call() {
        // The best we can say is that if the call references what this instruction defines, it
        // must be clobbered by it
        let Some(def_loc) = MemoryLocation::get(func, inst) else {
            return ModRefInfo::NO_MOD_REF;
        };
        return if aa.mod_ref_info_for_location(func, call, &def_loc).is_mod_or_ref() {
            ModRefInfo::MOD_REF
        } else {
            ModRefInfo::NO_MOD_REF
        };
    }

    let inst_behavior = aa.mod_ref_behavior(func, inst);
    let call_behavior = aa.mod_ref_behavior(func, call);
    if inst_behavior.does_not_access_memory() || call_behavior.does_not_access_memory() {
        return ModRefInfo::NO_MOD_REF;
    }

    // If they both only read from memory, there is no dependence
    if inst_behavior.only_reads_memory() && call_behavior.only_reads_memory() {
        return ModRefInfo::NO_MOD_REF;
    }

    let mut result = behavior_mod_ref(inst_behavior);

    if call_behavior.only_accesses_arg_pointees() {
        // Accumulate what `inst` does to each argument pointee that `call` accesses
        let call_effect = behavior_mod_ref(call_behavior);
        let mut arg_result = ModRefInfo::NO_MOD_REF;
        for arg in func.inst(call).arguments() {
            let loc = MemoryLocation::new(arg, LocationSize::Unknown);
            let inst_effect = aa.mod_ref_info_for_location(func, inst, &loc);
            if (call_effect.is_mod() && inst_effect.is_mod_or_ref())
                || (call_effect.is_ref() && inst_effect.is_mod())
            {
                arg_result |= inst_effect;
            }
        }
        result &= arg_result;
    } else if inst_behavior.only_accesses_arg_pointees() {
        // Only the pointees of the arguments of `inst` can be affected
        let mut arg_result = ModRefInfo::NO_MOD_REF;
        for arg in data.arguments() {
            let loc = MemoryLocation::new(arg, LocationSize::Unknown);
            if aa.mod_ref_info_for_location(func, call, &loc).is_mod_or_ref() {
                arg_result |= behavior_mod_ref(inst_behavior);
            }
        }
        result &= arg_result;
    }

    result
}

fn behavior_mod_ref(behavior: ModRefBehavior) -> ModRefInfo {
    if behavior.does_not_access_memory() {
        ModRefInfo::NO_MOD_REF
    } else if behavior.only_reads_memory() {
        ModRefInfo::REF
    } else {
        ModRefInfo::MOD_REF
    }
}

/// Chains a sequence of alias analyses together.
///
/// Alias queries are answered by the first analysis which gives a definite answer, while the
/// other queries combine what every analysis knows.
#[derive(Default)]
pub struct AAResults {
    analyses: Vec<Box<dyn AliasAnalysis>>,
}

impl AAResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// An aggregator with [BasicAliasAnalysis] as its only analysis
    pub fn with_basic() -> Self {
        let mut aa = Self::new();
        aa.add_analysis(BasicAliasAnalysis);
        aa
    }

    pub fn add_analysis<A>(&mut self, analysis: A) -> &mut Self
    where
        A: AliasAnalysis + 'static,
    {
        self.analyses.push(Box::new(analysis));
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.analyses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.analyses.is_empty()
    }
}

impl AliasAnalysis for AAResults {
    fn alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        self.analyses
            .iter()
            .map(|aa| aa.alias(func, a, b))
            .find(|result| *result != AliasResult::MayAlias)
            .unwrap_or(AliasResult::MayAlias)
    }

    fn points_to_constant_memory(
        &self,
        func: &Function,
        loc: &MemoryLocation,
        or_local: bool,
    ) -> bool {
        self.analyses.iter().any(|aa| aa.points_to_constant_memory(func, loc, or_local))
    }

    fn mod_ref_behavior(&self, func: &Function, call: Inst) -> ModRefBehavior {
        self.analyses.iter().fold(declared_behavior(func, call), |result, aa| {
            result.intersect(aa.mod_ref_behavior(func, call))
        })
    }

    fn mod_ref_info(&self, func: &Function, inst: Inst) -> ModRefInfo {
        self.analyses
            .iter()
            .fold(mod_ref_info_generic(self, func, inst), |result, aa| {
                result & aa.mod_ref_info(func, inst)
            })
    }

    fn mod_ref_info_for_location(
        &self,
        func: &Function,
        inst: Inst,
        loc: &MemoryLocation,
    ) -> ModRefInfo {
        self.analyses
            .iter()
            .fold(mod_ref_info_for_location_generic(self, func, inst, loc), |result, aa| {
                result & aa.mod_ref_info_for_location(func, inst, loc)
            })
    }

    fn mod_ref_info_for_call(&self, func: &Function, inst: Inst, call: Inst) -> ModRefInfo {
        self.analyses
            .iter()
            .fold(mod_ref_info_for_call_generic(self, func, inst, call), |result, aa| {
                result & aa.mod_ref_info_for_call(func, inst, call)
            })
    }
}
