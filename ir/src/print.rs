use core::fmt;

use crate::{AtomicOrdering, Block, Function, Inst, InstData, MemFlags, Value};

/// A hook for decorating the textual form of a [Function] with analysis results.
///
/// Each method is invoked immediately before the corresponding item is printed, and whatever is
/// written to `out` is emitted verbatim, so implementations are responsible for their own
/// indentation and line endings.
pub trait AnnotationWriter {
    /// Called after the label of `block`, before its first instruction
    fn block_start(&self, func: &Function, block: Block, out: &mut dyn fmt::Write) -> fmt::Result {
        let _ = (func, block, out);
        Ok(())
    }

    /// Called before `inst` is printed
    fn instruction(&self, func: &Function, inst: Inst, out: &mut dyn fmt::Write) -> fmt::Result {
        let _ = (func, inst, out);
        Ok(())
    }
}

/// Prints a [Function], optionally interleaved with annotations
pub struct FunctionPrinter<'a> {
    func: &'a Function,
    annotations: Option<&'a dyn AnnotationWriter>,
}

impl<'a> FunctionPrinter<'a> {
    pub fn new(func: &'a Function) -> Self {
        Self {
            func,
            annotations: None,
        }
    }

    pub fn with_annotations(func: &'a Function, annotations: &'a dyn AnnotationWriter) -> Self {
        Self {
            func,
            annotations: Some(annotations),
        }
    }

    fn write_inst(&self, f: &mut fmt::Formatter<'_>, inst: Inst) -> fmt::Result {
        let func = self.func;
        let data = func.inst(inst);
        f.write_str("    ")?;
        if let Some(result) = func.inst_result(inst) {
            write!(f, "{result} = ")?;
        }

        match data {
            InstData::Load {
                ptr,
                size,
                flags,
                ordering,
            } => {
                f.write_str("load")?;
                write_memory_attrs(f, *flags, *ordering)?;
                write!(f, " {ptr}, {size}")
            }
            InstData::Store {
                ptr,
                value,
                size,
                flags,
                ordering,
            } => {
                f.write_str("store")?;
                write_memory_attrs(f, *flags, *ordering)?;
                write!(f, " {ptr}, {value}, {size}")
            }
            InstData::Call { callee, args } => {
                write!(f, "call @{}(", func.ext_funcs[*callee].name)?;
                write_values(f, args)?;
                f.write_str(")")
            }
            InstData::Fence { ordering } => write!(f, "fence {}", ordering_name(*ordering)),
            InstData::Intrinsic { id, args } => {
                write!(f, "{id}(")?;
                write_values(f, args)?;
                f.write_str(")")
            }
            InstData::Alloca { size } => write!(f, "alloca {size}"),
            InstData::GlobalAddr { global } => {
                write!(f, "global_addr @{}", func.globals[*global].name)
            }
            InstData::PtrOffset { base, offset } => write!(f, "ptr_offset {base}, {offset}"),
            InstData::Iconst { imm } => write!(f, "iconst {imm}"),
            InstData::Binary { op, lhs, rhs } => write!(f, "{} {lhs}, {rhs}", op.name()),
            InstData::Jump { dest } => write!(f, "jump {}", func.block_name(*dest)),
            InstData::Branch {
                cond,
                then_dest,
                else_dest,
            } => write!(
                f,
                "br {cond}, {}, {}",
                func.block_name(*then_dest),
                func.block_name(*else_dest)
            ),
            InstData::Return { value: Some(value) } => write!(f, "ret {value}"),
            InstData::Return { value: None } => f.write_str("ret"),
            InstData::Unreachable => f.write_str("unreachable"),
        }
    }
}

impl fmt::Display for FunctionPrinter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.func;
        write!(f, "function {}(", func.name)?;
        write_values(f, &func.params)?;
        f.write_str(") {\n")?;

        for block in func.layout.blocks().iter().copied() {
            writeln!(f, "{}:", func.block_name(block))?;
            if let Some(annotations) = self.annotations {
                annotations.block_start(func, block, f)?;
            }
            for inst in func.layout.block_insts(block).iter().copied() {
                if let Some(annotations) = self.annotations {
                    annotations.instruction(func, inst, f)?;
                }
                self.write_inst(f, inst)?;
                f.write_str("\n")?;
            }
        }

        f.write_str("}\n")
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&FunctionPrinter::new(self), f)
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{value}")?;
    }
    Ok(())
}

fn write_memory_attrs(
    f: &mut fmt::Formatter<'_>,
    flags: MemFlags,
    ordering: AtomicOrdering,
) -> fmt::Result {
    if flags.contains(MemFlags::VOLATILE) {
        f.write_str(".volatile")?;
    }
    if flags.contains(MemFlags::INVARIANT) {
        f.write_str(".invariant")?;
    }
    if ordering != AtomicOrdering::NotAtomic {
        write!(f, ".{}", ordering_name(ordering))?;
    }
    Ok(())
}

fn ordering_name(ordering: AtomicOrdering) -> &'static str {
    match ordering {
        AtomicOrdering::NotAtomic => "not_atomic",
        AtomicOrdering::Unordered => "unordered",
        AtomicOrdering::Monotonic => "monotonic",
        AtomicOrdering::Acquire => "acquire",
        AtomicOrdering::Release => "release",
        AtomicOrdering::AcquireRelease => "acq_rel",
        AtomicOrdering::SequentiallyConsistent => "seq_cst",
    }
}
