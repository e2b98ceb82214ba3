#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};
pub use hashbrown;
pub use smallvec::{SmallVec, smallvec};

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub type FxHashSet<K> = hashbrown::HashSet<K, rustc_hash::FxBuildHasher>;
pub use rustc_hash::{FxBuildHasher, FxHasher};

mod builder;
pub mod cfg;
pub mod dominance;
mod entities;
mod function;
mod layout;
pub mod print;

pub use self::{
    builder::{FunctionBuilder, IrError},
    cfg::ControlFlowGraph,
    dominance::{
        DomNodeId, DomTreeBase, DomTreeError, DomTreeNode, DomTreeRoots, DominanceTree,
        ForwardIdfCalculator, IdfCalculator, PostDominanceTree, ReverseIdfCalculator,
    },
    entities::{Block, FuncRef, GlobalVar, Inst, Value},
    function::{
        AtomicOrdering, BinaryOp, BlockData, BlockName, ExtFuncData, Function, GlobalVarData,
        InstData, IntrinsicId, MemFlags, ModRefBehavior, ValueData,
    },
    layout::Layout,
    print::{AnnotationWriter, FunctionPrinter},
};
