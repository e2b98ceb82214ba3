mod idf;
mod nca;
mod tree;

pub use self::{
    idf::{ForwardIdfCalculator, IdfCalculator, ReverseIdfCalculator},
    tree::{DomNodeId, DomTreeBase, DomTreeError, DomTreeNode, DomTreeRoots, DominanceTree, PostDominanceTree},
};
