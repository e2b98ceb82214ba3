use core::cell::Cell;

use cranelift_entity::entity_impl;
use memssa_ir::{Block, Inst, SmallVec};

/// A stable handle to a [MemoryAccess] owned by a [super::MemorySsa]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryAccessId(u32);
entity_impl!(MemoryAccessId, "ma");

/// A node of the Memory SSA graph.
///
/// Every access is one of a memory definition (an instruction which may write memory, or whose
/// ordering constraints make it behave as such), a memory use (an instruction which only reads
/// memory), or a memory phi (a merge of the memory states flowing into a block).
#[derive(Debug)]
pub struct MemoryAccess {
    /// The number used to refer to this access when printing
    pub(crate) id: u32,
    pub(crate) block: Block,
    pub(crate) kind: MemoryAccessKind,
    /// The accesses which name this one as their defining access or as a phi operand.
    ///
    /// This is a multiset: a phi which receives this access along two edges appears twice.
    pub(crate) users: SmallVec<[MemoryAccessId; 4]>,
}

#[derive(Debug)]
pub enum MemoryAccessKind {
    Def(MemoryUseOrDef),
    Use(MemoryUseOrDef),
    Phi(MemoryPhi),
}

/// The state shared by memory uses and memory definitions
#[derive(Debug)]
pub struct MemoryUseOrDef {
    /// The instruction this access represents, `None` only for the live-on-entry definition
    pub(crate) inst: Option<Inst>,
    /// The nearest dominating definition (or phi) of the memory state this access observes
    pub(crate) defining: Option<MemoryAccessId>,
    /// The clobbering access found by a previous query, if still valid
    pub(crate) optimized: Cell<Option<MemoryAccessId>>,
}

#[derive(Debug, Default)]
pub struct MemoryPhi {
    /// One `(predecessor, value)` pair per incoming edge
    pub(crate) incoming: SmallVec<[(Block, MemoryAccessId); 2]>,
}

impl MemoryAccess {
    pub(crate) fn new_def(id: u32, block: Block, inst: Option<Inst>) -> Self {
        Self {
            id,
            block,
            kind: MemoryAccessKind::Def(MemoryUseOrDef::new(inst)),
            users: SmallVec::new(),
        }
    }

    pub(crate) fn new_use(block: Block, inst: Inst) -> Self {
        Self {
            id: 0,
            block,
            kind: MemoryAccessKind::Use(MemoryUseOrDef::new(Some(inst))),
            users: SmallVec::new(),
        }
    }

    pub(crate) fn new_phi(id: u32, block: Block) -> Self {
        Self {
            id,
            block,
            kind: MemoryAccessKind::Phi(MemoryPhi::default()),
            users: SmallVec::new(),
        }
    }

    /// The printable number of this access.
    ///
    /// Definitions and phis are numbered in creation order starting from 1, the live-on-entry
    /// definition and every use are numbered 0.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn block(&self) -> Block {
        self.block
    }

    #[inline]
    pub fn kind(&self) -> &MemoryAccessKind {
        &self.kind
    }

    #[inline]
    pub fn users(&self) -> &[MemoryAccessId] {
        &self.users
    }

    #[inline]
    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    #[inline]
    pub fn is_def(&self) -> bool {
        matches!(self.kind, MemoryAccessKind::Def(_))
    }

    #[inline]
    pub fn is_use(&self) -> bool {
        matches!(self.kind, MemoryAccessKind::Use(_))
    }

    #[inline]
    pub fn is_phi(&self) -> bool {
        matches!(self.kind, MemoryAccessKind::Phi(_))
    }

    /// Returns true if this access belongs in the definitions list of its block
    #[inline]
    pub fn is_def_or_phi(&self) -> bool {
        !self.is_use()
    }

    pub fn as_use_or_def(&self) -> Option<&MemoryUseOrDef> {
        match &self.kind {
            MemoryAccessKind::Def(access) | MemoryAccessKind::Use(access) => Some(access),
            MemoryAccessKind::Phi(_) => None,
        }
    }

    pub(crate) fn as_use_or_def_mut(&mut self) -> Option<&mut MemoryUseOrDef> {
        match &mut self.kind {
            MemoryAccessKind::Def(access) | MemoryAccessKind::Use(access) => Some(access),
            MemoryAccessKind::Phi(_) => None,
        }
    }

    pub fn as_phi(&self) -> Option<&MemoryPhi> {
        match &self.kind {
            MemoryAccessKind::Phi(phi) => Some(phi),
            _ => None,
        }
    }

    pub(crate) fn as_phi_mut(&mut self) -> Option<&mut MemoryPhi> {
        match &mut self.kind {
            MemoryAccessKind::Phi(phi) => Some(phi),
            _ => None,
        }
    }

    /// The instruction represented by this access, if it is a use or definition
    #[inline]
    pub fn inst(&self) -> Option<Inst> {
        self.as_use_or_def().and_then(|access| access.inst)
    }

    /// The defining access of a use or definition.
    ///
    /// Returns `None` for phis, and for the live-on-entry definition.
    #[inline]
    pub fn defining_access(&self) -> Option<MemoryAccessId> {
        self.as_use_or_def().and_then(|access| access.defining)
    }

    /// Every access this one refers to: the defining access of a use or definition, or each
    /// incoming value of a phi.
    pub fn operands(&self) -> SmallVec<[MemoryAccessId; 2]> {
        match &self.kind {
            MemoryAccessKind::Def(access) | MemoryAccessKind::Use(access) => {
                access.defining.into_iter().collect()
            }
            MemoryAccessKind::Phi(phi) => phi.incoming.iter().map(|(_, value)| *value).collect(),
        }
    }
}

impl MemoryUseOrDef {
    fn new(inst: Option<Inst>) -> Self {
        Self {
            inst,
            defining: None,
            optimized: Cell::new(None),
        }
    }

    #[inline]
    pub fn inst(&self) -> Option<Inst> {
        self.inst
    }

    #[inline]
    pub fn defining_access(&self) -> Option<MemoryAccessId> {
        self.defining
    }

    /// The cached clobbering access, if a query has already computed one
    #[inline]
    pub fn optimized(&self) -> Option<MemoryAccessId> {
        self.optimized.get()
    }

    #[inline]
    pub fn is_optimized(&self) -> bool {
        self.optimized.get().is_some()
    }
}

impl MemoryPhi {
    #[inline]
    pub fn incoming(&self) -> &[(Block, MemoryAccessId)] {
        &self.incoming
    }

    #[inline]
    pub fn num_incoming(&self) -> usize {
        self.incoming.len()
    }

    /// The value flowing in along the edge from `pred`
    pub fn incoming_value_for_block(&self, pred: Block) -> Option<MemoryAccessId> {
        self.incoming.iter().find(|(block, _)| *block == pred).map(|(_, value)| *value)
    }

    /// If every incoming edge carries the same value, return it
    pub fn unique_incoming_value(&self) -> Option<MemoryAccessId> {
        let (_, first) = self.incoming.first()?;
        self.incoming.iter().all(|(_, value)| value == first).then_some(*first)
    }
}
