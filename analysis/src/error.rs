use memssa_ir::{Block, DomTreeError};

use crate::MemoryAccessId;

/// Errors raised while constructing or verifying Memory SSA
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemorySsaError {
    #[error(transparent)]
    DomTree(#[from] DomTreeError),
    #[error("the accesses of {block} are out of sync with its instructions")]
    OrderingMismatch { block: Block },
    #[error("the definitions of {block} are out of sync with its access list")]
    DefsListMismatch { block: Block },
    #[error("{phi} has {incoming} incoming values, but {block} has {predecessors} predecessors")]
    IncompletePhi {
        phi: MemoryAccessId,
        block: Block,
        incoming: usize,
        predecessors: usize,
    },
    #[error("{phi} has an incoming value from {pred}, which is not a predecessor of its block")]
    UnknownPhiPredecessor { phi: MemoryAccessId, pred: Block },
    #[error("{def} does not dominate its user {user}")]
    DominationViolation {
        def: MemoryAccessId,
        user: MemoryAccessId,
    },
    #[error("{user} refers to {def}, but is missing from its users")]
    MissingUser {
        def: MemoryAccessId,
        user: MemoryAccessId,
    },
    #[error("{0} has no defining access")]
    MissingDefiningAccess(MemoryAccessId),
    #[error("{use_} is a memory use, but {user} refers to it as a definition")]
    UseAsDefinition {
        use_: MemoryAccessId,
        user: MemoryAccessId,
    },
}
