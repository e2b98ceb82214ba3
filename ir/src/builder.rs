use alloc::string::String;

use smallvec::SmallVec;

use crate::{
    AtomicOrdering, BinaryOp, Block, BlockData, ExtFuncData, FuncRef, Function, GlobalVar,
    GlobalVarData, Inst, InstData, IntrinsicId, MemFlags, ModRefBehavior, Value,
};

/// Errors raised when a [Function] fails validation
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IrError {
    #[error("function '{0}' has no blocks")]
    EmptyFunction(String),
    #[error("{0} does not end with a terminator")]
    MissingTerminator(Block),
    #[error("{inst} follows the terminator of {block}")]
    InstAfterTerminator { block: Block, inst: Inst },
    #[error("{inst} branches to {dest}, which is not in the layout")]
    UnknownBlock { inst: Inst, dest: Block },
    #[error("{inst} uses {value}, which is not defined in this function")]
    UnknownValue { inst: Inst, value: Value },
    #[error("the entry block {0} must not have predecessors")]
    EntryHasPredecessors(Block),
}

/// Incrementally constructs a [Function], one block at a time.
///
/// Instructions are appended to the block most recently selected with
/// [FunctionBuilder::switch_to_block].
pub struct FunctionBuilder {
    func: Function,
    current: Option<Block>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            func: Function::new(name),
            current: None,
        }
    }

    #[inline]
    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn append_param(&mut self) -> Value {
        self.func.append_param()
    }

    /// Create a new, unnamed block and append it to the layout
    pub fn create_block(&mut self) -> Block {
        let block = self.func.blocks.push(BlockData::default());
        self.func.layout.append_block(block);
        block
    }

    /// Create a new block with a name used when printing, and append it to the layout
    pub fn create_named_block(&mut self, name: impl Into<String>) -> Block {
        let block = self.func.blocks.push(BlockData {
            name: Some(name.into()),
        });
        self.func.layout.append_block(block);
        block
    }

    pub fn switch_to_block(&mut self, block: Block) {
        self.current = Some(block);
    }

    #[inline]
    pub fn current_block(&self) -> Option<Block> {
        self.current
    }

    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        behavior: ModRefBehavior,
    ) -> FuncRef {
        self.func.ext_funcs.push(ExtFuncData {
            name: name.into(),
            behavior,
        })
    }

    pub fn declare_global(&mut self, name: impl Into<String>, size: u64, constant: bool) -> GlobalVar {
        self.func.globals.push(GlobalVarData {
            name: name.into(),
            size,
            constant,
        })
    }

    /// Append `data` to the current block
    pub fn ins(&mut self, data: InstData) -> Inst {
        let block = self.current.expect("no block selected, call switch_to_block first");
        let inst = self.func.make_inst(data);
        self.func.layout.append_inst(inst, block);
        inst
    }

    fn ins_with_result(&mut self, data: InstData) -> Value {
        let inst = self.ins(data);
        self.func.inst_result(inst).expect("instruction has no result")
    }

    pub fn alloca(&mut self, size: u64) -> Value {
        self.ins_with_result(InstData::Alloca { size })
    }

    pub fn global_addr(&mut self, global: GlobalVar) -> Value {
        self.ins_with_result(InstData::GlobalAddr { global })
    }

    pub fn ptr_offset(&mut self, base: Value, offset: i64) -> Value {
        self.ins_with_result(InstData::PtrOffset { base, offset })
    }

    pub fn iconst(&mut self, imm: i64) -> Value {
        self.ins_with_result(InstData::Iconst { imm })
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        self.ins_with_result(InstData::Binary { op, lhs, rhs })
    }

    /// A plain, non-atomic load of `size` bytes
    pub fn load(&mut self, ptr: Value, size: u64) -> Value {
        self.load_with(ptr, size, MemFlags::empty(), AtomicOrdering::NotAtomic)
    }

    pub fn load_with(
        &mut self,
        ptr: Value,
        size: u64,
        flags: MemFlags,
        ordering: AtomicOrdering,
    ) -> Value {
        self.ins_with_result(InstData::Load {
            ptr,
            size,
            flags,
            ordering,
        })
    }

    /// A plain, non-atomic store of `size` bytes
    pub fn store(&mut self, ptr: Value, value: Value, size: u64) -> Inst {
        self.store_with(ptr, value, size, MemFlags::empty(), AtomicOrdering::NotAtomic)
    }

    pub fn store_with(
        &mut self,
        ptr: Value,
        value: Value,
        size: u64,
        flags: MemFlags,
        ordering: AtomicOrdering,
    ) -> Inst {
        self.ins(InstData::Store {
            ptr,
            value,
            size,
            flags,
            ordering,
        })
    }

    pub fn call(&mut self, callee: FuncRef, args: &[Value]) -> Inst {
        self.ins(InstData::Call {
            callee,
            args: SmallVec::from_slice(args),
        })
    }

    pub fn fence(&mut self, ordering: AtomicOrdering) -> Inst {
        self.ins(InstData::Fence { ordering })
    }

    pub fn intrinsic(&mut self, id: IntrinsicId, args: &[Value]) -> Inst {
        self.ins(InstData::Intrinsic {
            id,
            args: SmallVec::from_slice(args),
        })
    }

    pub fn jump(&mut self, dest: Block) -> Inst {
        self.ins(InstData::Jump { dest })
    }

    pub fn branch(&mut self, cond: Value, then_dest: Block, else_dest: Block) -> Inst {
        self.ins(InstData::Branch {
            cond,
            then_dest,
            else_dest,
        })
    }

    pub fn ret(&mut self, value: Option<Value>) -> Inst {
        self.ins(InstData::Return { value })
    }

    pub fn unreachable(&mut self) -> Inst {
        self.ins(InstData::Unreachable)
    }

    /// Validate the function under construction, and return it
    pub fn finish(self) -> Result<Function, IrError> {
        validate(&self.func)?;
        Ok(self.func)
    }
}

/// Check the structural well-formedness of `func`
fn validate(func: &Function) -> Result<(), IrError> {
    let Some(entry) = func.entry_block() else {
        return Err(IrError::EmptyFunction(func.name.clone()));
    };

    for block in func.layout.blocks().iter().copied() {
        let insts = func.layout.block_insts(block);
        let Some((last, body)) = insts.split_last() else {
            return Err(IrError::MissingTerminator(block));
        };
        if let Some(inst) = body.iter().copied().find(|inst| func.inst(*inst).is_terminator()) {
            let position = insts.iter().position(|i| *i == inst).unwrap_or_default();
            return Err(IrError::InstAfterTerminator {
                block,
                inst: insts[position + 1],
            });
        }
        let terminator = func.inst(*last);
        if !terminator.is_terminator() {
            return Err(IrError::MissingTerminator(block));
        }

        for inst in insts.iter().copied() {
            let data = func.inst(inst);
            if let Some(value) = data.arguments().into_iter().find(|v| !func.is_valid_value(*v)) {
                return Err(IrError::UnknownValue { inst, value });
            }
            for dest in data.successors() {
                if !func.blocks.is_valid(dest) || !func.layout.is_block_inserted(dest) {
                    return Err(IrError::UnknownBlock { inst, dest });
                }
                if dest == entry {
                    return Err(IrError::EntryHasPredecessors(entry));
                }
            }
        }
    }

    Ok(())
}
