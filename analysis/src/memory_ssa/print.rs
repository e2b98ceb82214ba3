use core::fmt;

use memssa_ir::{AnnotationWriter, Block, Function, FunctionPrinter, Inst};

use super::{MemoryAccessId, MemoryAccessKind, MemorySsa};

/// Displays a single access as `1 = MemoryDef(liveOnEntry)`, `MemoryUse(1)`, or
/// `3 = MemoryPhi({block1,1},{block2,2})`
pub struct DisplayMemoryAccess<'a> {
    mssa: &'a MemorySsa,
    func: &'a Function,
    access: MemoryAccessId,
}

impl DisplayMemoryAccess<'_> {
    fn write_operand(&self, f: &mut dyn fmt::Write, operand: MemoryAccessId) -> fmt::Result {
        if self.mssa.is_live_on_entry_def(operand) {
            f.write_str("liveOnEntry")
        } else {
            write!(f, "{}", self.mssa.access(operand).id())
        }
    }

    fn write(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        let access = self.mssa.access(self.access);
        match access.kind() {
            MemoryAccessKind::Def(def) => {
                write!(f, "{} = MemoryDef(", access.id())?;
                match def.defining_access() {
                    Some(defining) => self.write_operand(f, defining)?,
                    None => f.write_str("liveOnEntry")?,
                }
                f.write_str(")")
            }
            MemoryAccessKind::Use(use_) => {
                f.write_str("MemoryUse(")?;
                match use_.defining_access() {
                    Some(defining) => self.write_operand(f, defining)?,
                    None => f.write_str("liveOnEntry")?,
                }
                f.write_str(")")
            }
            MemoryAccessKind::Phi(phi) => {
                write!(f, "{} = MemoryPhi(", access.id())?;
                for (i, (pred, value)) in phi.incoming().iter().copied().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{{{},", self.func.block_name(pred))?;
                    self.write_operand(f, value)?;
                    f.write_str("}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for DisplayMemoryAccess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f)
    }
}

/// Displays a function with the memory accesses of each block and instruction as comments
pub struct DisplayMemorySsa<'a> {
    mssa: &'a MemorySsa,
    func: &'a Function,
}

impl AnnotationWriter for DisplayMemorySsa<'_> {
    fn block_start(&self, _func: &Function, block: Block, out: &mut dyn fmt::Write) -> fmt::Result {
        match self.mssa.memory_phi(block) {
            Some(phi) => self.write_access(phi, out),
            None => Ok(()),
        }
    }

    fn instruction(&self, _func: &Function, inst: Inst, out: &mut dyn fmt::Write) -> fmt::Result {
        match self.mssa.memory_access(inst) {
            Some(access) => self.write_access(access, out),
            None => Ok(()),
        }
    }
}

impl DisplayMemorySsa<'_> {
    fn write_access(&self, access: MemoryAccessId, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str("    ; ")?;
        self.mssa.display_access(self.func, access).write(out)?;
        out.write_str("\n")
    }
}

impl fmt::Display for DisplayMemorySsa<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&FunctionPrinter::with_annotations(self.func, self), f)
    }
}

impl MemorySsa {
    /// Get a displayable form of `access`, naming blocks as they are named in `func`
    pub fn display_access<'a>(
        &'a self,
        func: &'a Function,
        access: MemoryAccessId,
    ) -> DisplayMemoryAccess<'a> {
        DisplayMemoryAccess {
            mssa: self,
            func,
            access,
        }
    }

    /// Get a displayable form of `func` annotated with its memory accesses
    pub fn display<'a>(&'a self, func: &'a Function) -> DisplayMemorySsa<'a> {
        DisplayMemorySsa { mssa: self, func }
    }
}
