use alloc::{string::String, vec::Vec};
use core::fmt;

use cranelift_entity::{PrimaryMap, SecondaryMap};
use smallvec::{SmallVec, smallvec};

use crate::{Block, FuncRef, GlobalVar, Inst, Layout, Value};

bitflags::bitflags! {
    /// Flags which modify the semantics of a load or store
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemFlags: u8 {
        /// The access must not be elided, duplicated, or reordered with other volatile accesses
        const VOLATILE = 1;
        /// The loaded memory is known to never change while it is dereferenceable
        const INVARIANT = 1 << 1;
    }
}

/// The atomic ordering constraint of a memory operation
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AtomicOrdering {
    #[default]
    NotAtomic,
    Unordered,
    Monotonic,
    Acquire,
    Release,
    AcquireRelease,
    SequentiallyConsistent,
}

impl AtomicOrdering {
    /// Returns true if `self` is at least as strong as `other`.
    ///
    /// Orderings form a lattice rather than a total order: `Acquire` and `Release` are not
    /// comparable with each other.
    pub fn is_at_least_or_stronger_than(self, other: Self) -> bool {
        use AtomicOrdering::*;

        match (self, other) {
            (a, b) if a == b => true,
            (_, NotAtomic) => true,
            (NotAtomic, _) => false,
            (_, Unordered) => true,
            (Unordered, _) => false,
            (_, Monotonic) => true,
            (Monotonic, _) => false,
            (AcquireRelease | SequentiallyConsistent, Acquire | Release) => true,
            (SequentiallyConsistent, AcquireRelease) => true,
            _ => false,
        }
    }

    /// Returns true if `self` is strictly stronger than `other`
    pub fn is_stronger_than(self, other: Self) -> bool {
        self != other && self.is_at_least_or_stronger_than(other)
    }
}

/// The intrinsics understood by the IR
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IntrinsicId {
    /// `assume(cond)`
    Assume,
    /// `lifetime.start(ptr)`
    LifetimeStart,
    /// `lifetime.end(ptr)`
    LifetimeEnd,
    /// `invariant.start(ptr)`
    InvariantStart,
    /// `invariant.end(ptr)`
    InvariantEnd,
}

impl IntrinsicId {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Assume => "assume",
            Self::LifetimeStart => "lifetime.start",
            Self::LifetimeEnd => "lifetime.end",
            Self::InvariantStart => "invariant.start",
            Self::InvariantEnd => "invariant.end",
        }
    }
}

impl fmt::Display for IntrinsicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A summary of how a function may interact with memory
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ModRefBehavior {
    /// The function neither reads nor writes memory
    DoesNotAccessMemory,
    /// The function only reads memory reachable through its pointer arguments
    OnlyReadsArgumentPointees,
    /// The function only reads and writes memory reachable through its pointer arguments
    OnlyAccessesArgumentPointees,
    /// The function may read any memory, but never writes
    OnlyReadsMemory,
    /// Nothing is known
    #[default]
    UnknownModRefBehavior,
}

impl ModRefBehavior {
    #[inline]
    pub fn does_not_access_memory(self) -> bool {
        matches!(self, Self::DoesNotAccessMemory)
    }

    #[inline]
    pub fn only_reads_memory(self) -> bool {
        matches!(
            self,
            Self::DoesNotAccessMemory | Self::OnlyReadsMemory | Self::OnlyReadsArgumentPointees
        )
    }

    #[inline]
    pub fn only_accesses_arg_pointees(self) -> bool {
        matches!(self, Self::OnlyReadsArgumentPointees | Self::OnlyAccessesArgumentPointees)
    }

    /// Combine two summaries of the same callee, keeping whatever each one proves
    pub fn intersect(self, other: Self) -> Self {
        if self.does_not_access_memory() || other.does_not_access_memory() {
            return Self::DoesNotAccessMemory;
        }
        let reads_only = self.only_reads_memory() || other.only_reads_memory();
        let args_only = self.only_accesses_arg_pointees() || other.only_accesses_arg_pointees();
        match (reads_only, args_only) {
            (true, true) => Self::OnlyReadsArgumentPointees,
            (true, false) => Self::OnlyReadsMemory,
            (false, true) => Self::OnlyAccessesArgumentPointees,
            (false, false) => Self::UnknownModRefBehavior,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Eq,
    Lt,
}

impl BinaryOp {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Eq => "eq",
            Self::Lt => "lt",
        }
    }
}

/// The instruction set of the IR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstData {
    Load {
        ptr: Value,
        size: u64,
        flags: MemFlags,
        ordering: AtomicOrdering,
    },
    Store {
        ptr: Value,
        value: Value,
        size: u64,
        flags: MemFlags,
        ordering: AtomicOrdering,
    },
    Call {
        callee: FuncRef,
        args: SmallVec<[Value; 4]>,
    },
    Fence {
        ordering: AtomicOrdering,
    },
    Intrinsic {
        id: IntrinsicId,
        args: SmallVec<[Value; 2]>,
    },
    Alloca {
        size: u64,
    },
    GlobalAddr {
        global: GlobalVar,
    },
    PtrOffset {
        base: Value,
        offset: i64,
    },
    Iconst {
        imm: i64,
    },
    Binary {
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
    },
    Jump {
        dest: Block,
    },
    Branch {
        cond: Value,
        then_dest: Block,
        else_dest: Block,
    },
    Return {
        value: Option<Value>,
    },
    Unreachable,
}

impl InstData {
    /// Returns true if this instruction ends a block
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Jump { .. } | Self::Branch { .. } | Self::Return { .. } | Self::Unreachable)
    }

    /// Returns true if this instruction produces a value
    pub fn has_result(&self) -> bool {
        matches!(
            self,
            Self::Load { .. }
                | Self::Call { .. }
                | Self::Alloca { .. }
                | Self::GlobalAddr { .. }
                | Self::PtrOffset { .. }
                | Self::Iconst { .. }
                | Self::Binary { .. }
        )
    }

    /// Returns true for calls and intrinsic calls
    #[inline]
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. } | Self::Intrinsic { .. })
    }

    #[inline]
    pub fn is_fence(&self) -> bool {
        matches!(self, Self::Fence { .. })
    }

    /// Returns true if this instruction is a load or store that is neither volatile, nor atomic
    /// with an ordering stronger than `Unordered`.
    ///
    /// Returns false for every other kind of instruction.
    pub fn is_unordered_access(&self) -> bool {
        match self {
            Self::Load {
                flags, ordering, ..
            }
            | Self::Store {
                flags, ordering, ..
            } => {
                !flags.contains(MemFlags::VOLATILE)
                    && !ordering.is_stronger_than(AtomicOrdering::Unordered)
            }
            _ => false,
        }
    }

    /// Returns true if this is a load or store with ordering constraints
    pub fn is_ordered_access(&self) -> bool {
        matches!(self, Self::Load { .. } | Self::Store { .. }) && !self.is_unordered_access()
    }

    /// The pointer operand of a load or store
    pub fn pointer_operand(&self) -> Option<Value> {
        match self {
            Self::Load { ptr, .. } | Self::Store { ptr, .. } => Some(*ptr),
            _ => None,
        }
    }

    /// The intrinsic identifier, if this is an intrinsic call
    pub fn intrinsic_id(&self) -> Option<IntrinsicId> {
        match self {
            Self::Intrinsic { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// All value operands of this instruction, in order
    pub fn arguments(&self) -> SmallVec<[Value; 4]> {
        match self {
            Self::Load { ptr, .. } => smallvec![*ptr],
            Self::Store { ptr, value, .. } => smallvec![*ptr, *value],
            Self::Call { args, .. } => args.clone(),
            Self::Intrinsic { args, .. } => args.iter().copied().collect(),
            Self::PtrOffset { base, .. } => smallvec![*base],
            Self::Binary { lhs, rhs, .. } => smallvec![*lhs, *rhs],
            Self::Branch { cond, .. } => smallvec![*cond],
            Self::Return { value } => value.iter().copied().collect(),
            Self::Fence { .. }
            | Self::Alloca { .. }
            | Self::GlobalAddr { .. }
            | Self::Iconst { .. }
            | Self::Jump { .. }
            | Self::Unreachable => SmallVec::new(),
        }
    }

    /// The successor blocks of a terminator, in operand order.
    ///
    /// A block which is named by more than one successor edge is only reported once.
    pub fn successors(&self) -> SmallVec<[Block; 2]> {
        match self {
            Self::Jump { dest } => smallvec![*dest],
            Self::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                if then_dest == else_dest {
                    smallvec![*then_dest]
                } else {
                    smallvec![*then_dest, *else_dest]
                }
            }
            _ => SmallVec::new(),
        }
    }
}

/// The definition of a [Value]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueData {
    /// The `index`th parameter of the function
    Param { index: usize },
    /// The result of `inst`
    Inst { inst: Inst },
}

#[derive(Debug, Default, Clone)]
pub struct BlockData {
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtFuncData {
    pub name: String,
    pub behavior: ModRefBehavior,
}

#[derive(Debug, Clone)]
pub struct GlobalVarData {
    pub name: String,
    pub size: u64,
    /// Whether the contents of the global never change
    pub constant: bool,
}

/// A function body: blocks, instructions, values, and the layout which orders them
#[derive(Debug, Default, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Value>,
    pub blocks: PrimaryMap<Block, BlockData>,
    pub insts: PrimaryMap<Inst, InstData>,
    pub values: PrimaryMap<Value, ValueData>,
    pub ext_funcs: PrimaryMap<FuncRef, ExtFuncData>,
    pub globals: PrimaryMap<GlobalVar, GlobalVarData>,
    pub layout: Layout,
    results: SecondaryMap<Inst, Option<Value>>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The entry block of this function, if it has any blocks
    #[inline]
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.entry_block()
    }

    #[inline]
    pub fn inst(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }

    /// The value produced by `inst`, if any
    #[inline]
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst]
    }

    /// The instruction defining `value`, or `None` if it is a function parameter
    pub fn value_def(&self, value: Value) -> Option<Inst> {
        match self.values[value] {
            ValueData::Inst { inst } => Some(inst),
            ValueData::Param { .. } => None,
        }
    }

    /// The printable name of `block`
    pub fn block_name(&self, block: Block) -> BlockName<'_> {
        BlockName { func: self, block }
    }

    /// Create a new instruction, not yet placed in the layout
    pub fn make_inst(&mut self, data: InstData) -> Inst {
        let has_result = data.has_result();
        let inst = self.insts.push(data);
        if has_result {
            let value = self.values.push(ValueData::Inst { inst });
            self.results[inst] = Some(value);
        }
        inst
    }

    /// Append a new parameter to the function signature
    pub fn append_param(&mut self) -> Value {
        let index = self.params.len();
        let value = self.values.push(ValueData::Param { index });
        self.params.push(value);
        value
    }

    /// Returns true if `value` refers to a value defined in this function
    #[inline]
    pub fn is_valid_value(&self, value: Value) -> bool {
        self.values.is_valid(value)
    }
}

/// Displays a block by its name, if it has one, otherwise by its identifier
pub struct BlockName<'a> {
    func: &'a Function,
    block: Block,
}

impl fmt::Display for BlockName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.func.blocks.get(self.block).and_then(|data| data.name.as_deref()) {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.block),
        }
    }
}
