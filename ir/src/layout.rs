use alloc::vec::Vec;

use cranelift_entity::SecondaryMap;

use crate::{Block, Inst};

/// The program order of the blocks in a function, and of the instructions in each block.
#[derive(Debug, Default, Clone)]
pub struct Layout {
    blocks: Vec<Block>,
    block_insts: SecondaryMap<Block, Vec<Inst>>,
    inst_block: SecondaryMap<Inst, Option<Block>>,
    inserted: SecondaryMap<Block, bool>,
}

impl Layout {
    /// The first block in layout order
    #[inline]
    pub fn entry_block(&self) -> Option<Block> {
        self.blocks.first().copied()
    }

    /// All blocks, in layout order
    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_block_inserted(&self, block: Block) -> bool {
        self.inserted[block]
    }

    /// The index of `block` in layout order
    pub fn block_position(&self, block: Block) -> Option<usize> {
        self.blocks.iter().position(|b| *b == block)
    }

    pub fn append_block(&mut self, block: Block) {
        assert!(!self.inserted[block], "{block} is already in the layout");
        self.inserted[block] = true;
        self.blocks.push(block);
    }

    /// The instructions of `block`, in program order
    #[inline]
    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.block_insts[block]
    }

    /// The last instruction of `block`, normally its terminator
    #[inline]
    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.block_insts[block].last().copied()
    }

    /// The block containing `inst`, if it has been placed
    #[inline]
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.inst_block[inst]
    }

    pub fn append_inst(&mut self, inst: Inst, block: Block) {
        assert!(self.inst_block[inst].is_none(), "{inst} is already in the layout");
        assert!(self.inserted[block], "{block} is not in the layout");
        self.block_insts[block].push(inst);
        self.inst_block[inst] = Some(block);
    }

    /// Insert `inst` immediately before `before`, in the block containing `before`
    pub fn insert_inst_before(&mut self, inst: Inst, before: Inst) {
        assert!(self.inst_block[inst].is_none(), "{inst} is already in the layout");
        let block = self.inst_block[before].expect("insertion point is not in the layout");
        let insts = &mut self.block_insts[block];
        let index = insts.iter().position(|i| *i == before).expect("layout is out of sync");
        insts.insert(index, inst);
        self.inst_block[inst] = Some(block);
    }

    /// Detach `inst` from the layout, without destroying it
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.inst_block[inst].expect("instruction is not in the layout");
        let insts = &mut self.block_insts[block];
        let index = insts.iter().position(|i| *i == inst).expect("layout is out of sync");
        insts.remove(index);
        self.inst_block[inst] = None;
    }

    /// The index of `inst` within its block
    pub fn position(&self, inst: Inst) -> Option<usize> {
        let block = self.inst_block[inst]?;
        self.block_insts[block].iter().position(|i| *i == inst)
    }

    /// Move `inst` so that it immediately precedes `before`
    pub fn move_inst_before(&mut self, inst: Inst, before: Inst) {
        self.remove_inst(inst);
        self.insert_inst_before(inst, before);
    }

    /// Move `inst` to the end of `block`
    pub fn move_inst_to_end(&mut self, inst: Inst, block: Block) {
        self.remove_inst(inst);
        self.append_inst(inst, block);
    }
}
