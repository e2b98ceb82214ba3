use cranelift_entity::SecondaryMap;
use smallvec::{SmallVec, smallvec};

use super::{DomTreeError, DomTreeRoots};
use crate::{Block, ControlFlowGraph};

/// [SemiNCA] computes the immediate dominators of a control-flow graph using the Semi-NCA
/// algorithm described in the following dissertation:
///
///   [1] Linear-Time Algorithms for Dominators and Related Problems
///   Loukas Georgiadis, Princeton University, November 2005, pp. 21-23:
///   ftp://ftp.cs.princeton.edu/reports/2005/737.pdf
///
/// The Semi-NCA algorithm runs in O(n^2) worst-case time but usually slightly faster than Simple
/// Lengauer-Tarjan in practice.
///
/// Nodes are identified by their DFS number. Number 0 is never assigned, and for post-dominance
/// number 1 is the virtual exit node, which has no block.
pub(super) struct SemiNCA<const IS_POST_DOM: bool> {
    /// Number to node mapping is 1-based.
    num_to_node: SmallVec<[Option<Block>; 64]>,
    /// The DFS number of each visited block, or 0 if not (yet) visited
    node_to_num: SecondaryMap<Block, u32>,
    /// Per-node state, indexed by DFS number
    infos: SmallVec<[NodeInfo; 64]>,
    roots: DomTreeRoots,
}

#[derive(Default, Clone)]
struct NodeInfo {
    parent: u32,
    semi: u32,
    label: u32,
    idom: u32,
    reverse_children: SmallVec<[u32; 4]>,
}

impl<const IS_POST_DOM: bool> SemiNCA<IS_POST_DOM> {
    fn new() -> Self {
        Self {
            num_to_node: smallvec![None],
            node_to_num: SecondaryMap::new(),
            infos: smallvec![NodeInfo::default()],
            roots: DomTreeRoots::default(),
        }
    }

    /// Compute the immediate dominators for all nodes of `cfg` reachable from the roots
    pub fn compute(cfg: &ControlFlowGraph) -> Result<Self, DomTreeError> {
        let entry = cfg.entry_block().ok_or(DomTreeError::EmptyFunction)?;
        let mut snca = Self::new();

        if !IS_POST_DOM {
            snca.roots.push(Some(entry));
            snca.run_dfs(cfg, entry, 0, 0);
            snca.run();
            return Ok(snca);
        }

        // Post-dominator trees always have a virtual root, which all exits are attached to
        snca.add_virtual_root();
        let mut num = 1u32;

        log::trace!(target: "dominance", "looking for trivial roots");
        for exit in cfg.exit_blocks() {
            snca.roots.push(Some(exit));
            num = snca.run_dfs(cfg, exit, num, 1);
            log::trace!(target: "dominance", "found a new trivial root: {exit}");
        }

        // Blocks which cannot reach an exit are part of, or lead to, an infinite loop. Pick the
        // last such block in layout order as an additional root, until everything is visited.
        log::trace!(target: "dominance", "looking for non-trivial roots");
        for block in cfg.blocks().iter().rev().copied() {
            if snca.node_to_num[block] != 0 {
                continue;
            }
            snca.roots.push(Some(block));
            num = snca.run_dfs(cfg, block, num, 1);
            log::trace!(target: "dominance", "found a new non-trivial root: {block}");
        }

        snca.run();
        Ok(snca)
    }

    /// The number of DFS numbers in use, including the unused number 0
    #[inline]
    pub fn len(&self) -> usize {
        self.num_to_node.len()
    }

    /// The block with DFS number `num`, or `None` for the virtual root
    #[inline]
    pub fn block(&self, num: usize) -> Option<Block> {
        self.num_to_node[num]
    }

    /// The DFS number of the immediate dominator of the node numbered `num`
    #[inline]
    pub fn idom(&self, num: usize) -> usize {
        self.infos[num].idom as usize
    }

    pub fn take_roots(&mut self) -> DomTreeRoots {
        core::mem::take(&mut self.roots)
    }

    fn add_virtual_root(&mut self) {
        assert_eq!(self.num_to_node.len(), 1, "SemiNCA must be freshly constructed");
        self.num_to_node.push(None);
        self.infos.push(NodeInfo {
            parent: 0,
            semi: 1,
            label: 1,
            idom: 0,
            reverse_children: SmallVec::new(),
        });
    }

    /// Number the nodes reachable from `root` in depth-first preorder, starting after `last_num`.
    ///
    /// The traversal follows successors for dominators, and predecessors for post-dominators. It
    /// also collects reverse children so that we don't have to spend time getting predecessors in
    /// [Self::run].
    fn run_dfs(
        &mut self,
        cfg: &ControlFlowGraph,
        root: Block,
        mut last_num: u32,
        attach_to_num: u32,
    ) -> u32 {
        let mut worklist = SmallVec::<[(Block, u32); 64]>::from_iter([(root, attach_to_num)]);

        while let Some((block, parent_num)) = worklist.pop() {
            // Visited nodes always have positive DFS numbers.
            let num = self.node_to_num[block];
            if num != 0 {
                self.infos[num as usize].reverse_children.push(parent_num);
                continue;
            }

            last_num += 1;
            self.node_to_num[block] = last_num;
            self.num_to_node.push(Some(block));
            self.infos.push(NodeInfo {
                parent: parent_num,
                semi: last_num,
                label: last_num,
                idom: 0,
                reverse_children: smallvec![parent_num],
            });

            let mut successors =
                SmallVec::<[Block; 8]>::from_slice(cfg.children::<IS_POST_DOM>(block));
            if !IS_POST_DOM {
                successors.reverse();
            }
            for succ in successors {
                worklist.push((succ, last_num));
            }
        }

        last_num
    }

    // V is a predecessor of W. eval() returns V if V < W, otherwise the minimum
    // of sdom(U), where U > W and there is a virtual forest path from U to V. The
    // virtual forest consists of linked edges of processed vertices.
    //
    // We can follow Parent pointers (virtual forest edges) to determine the
    // ancestor U with minimum sdom(U). But it is slow and thus we employ the path
    // compression technique to speed up to O(m*log(n)).
    //
    // For each vertex V, its Label points to the vertex with the minimal sdom(U)
    // (Semi) in its path from V (included) to NodeToInfo[V].Parent (excluded).
    fn eval(&mut self, v: u32, last_linked: u32, eval_stack: &mut SmallVec<[u32; 32]>) -> u32 {
        let mut v = v;
        if self.infos[v as usize].parent < last_linked {
            return self.infos[v as usize].label;
        }

        // Store ancestors except the last (root of a virtual tree) into a stack.
        eval_stack.clear();
        loop {
            eval_stack.push(v);
            v = self.infos[v as usize].parent;
            if self.infos[v as usize].parent < last_linked {
                break;
            }
        }

        // Path compression. Point each vertex's `parent` to the root and update its `label` if any
        // of its ancestors `label` has a smaller `semi`
        let mut p = v;
        let mut p_label = self.infos[p as usize].label;
        while let Some(w) = eval_stack.pop() {
            v = w;
            self.infos[v as usize].parent = self.infos[p as usize].parent;
            let v_label = self.infos[v as usize].label;
            if self.infos[p_label as usize].semi < self.infos[v_label as usize].semi {
                self.infos[v as usize].label = self.infos[p as usize].label;
            } else {
                p_label = v_label;
            }
            p = v;
        }

        self.infos[v as usize].label
    }

    /// This function requires DFS to be run before calling it.
    fn run(&mut self) {
        let next_num = self.infos.len();

        // Initialize idoms to spanning tree parents
        for info in self.infos.iter_mut().skip(1) {
            info.idom = info.parent;
        }

        // Step 1: Calculate the semi-dominators of all vertices
        let mut eval_stack = SmallVec::<[u32; 32]>::default();
        for i in (2..next_num).rev() {
            // Initialize the semi-dominator to point to the parent node.
            self.infos[i].semi = self.infos[i].parent;
            let reverse_children = core::mem::take(&mut self.infos[i].reverse_children);
            for n in reverse_children.iter().copied() {
                let label = self.eval(n, i as u32 + 1, &mut eval_stack);
                let semi_u = self.infos[label as usize].semi;
                if semi_u < self.infos[i].semi {
                    self.infos[i].semi = semi_u;
                }
            }
            self.infos[i].reverse_children = reverse_children;
        }

        // Step 2: Explicitly define the immediate dominator of each vertex.
        //
        //     IDom[i] = NCA(SDom[i], SpanningTreeParent(i))
        //
        // Note that the parents were stored in IDoms and later got invalidated during path
        // compression in `eval`
        for i in 2..next_num {
            let s_dom_num = self.infos[i].semi;
            assert_ne!(s_dom_num, 0);
            let mut w_idom_candidate = self.infos[i].idom;
            while w_idom_candidate > s_dom_num {
                w_idom_candidate = self.infos[w_idom_candidate as usize].idom;
            }
            self.infos[i].idom = w_idom_candidate;
        }
    }
}
