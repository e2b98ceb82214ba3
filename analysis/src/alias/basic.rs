use memssa_ir::{Function, GlobalVar, Inst, InstData, Value, ValueData};

use super::{AliasAnalysis, AliasResult, MemoryLocation};

/// A stateless alias analysis which reasons about the objects underlying each pointer.
///
/// Pointers are decomposed into a base value plus a constant byte offset by looking through
/// `ptr_offset` instructions. Two locations with the same base are compared by their offsets and
/// sizes. Locations with different bases are known not to alias when both bases are distinct
/// identified objects (stack slots or globals), or when one is a stack slot of this function and
/// the other is a function parameter.
#[derive(Debug, Default, Copy, Clone)]
pub struct BasicAliasAnalysis;

/// The object a pointer is derived from
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum UnderlyingObject {
    Alloca(Inst),
    Global(GlobalVar),
    Param,
    Unknown,
}

impl UnderlyingObject {
    fn of(func: &Function, base: Value) -> Self {
        match func.values[base] {
            ValueData::Param { .. } => Self::Param,
            ValueData::Inst { inst } => match func.inst(inst) {
                InstData::Alloca { .. } => Self::Alloca(inst),
                InstData::GlobalAddr { global } => Self::Global(*global),
                _ => Self::Unknown,
            },
        }
    }

    /// Identified objects are distinct allocations, which never overlap one another
    fn is_identified(self) -> bool {
        matches!(self, Self::Alloca(_) | Self::Global(_))
    }
}

/// Strip constant offsets from `ptr`, returning the base pointer and the accumulated offset, or
/// `None` if the offset overflowed
fn decompose(func: &Function, mut ptr: Value) -> (Value, Option<i64>) {
    let mut offset = Some(0i64);
    while let Some(InstData::PtrOffset { base, offset: delta }) =
        func.value_def(ptr).map(|inst| func.inst(inst))
    {
        offset = offset.and_then(|offset| offset.checked_add(*delta));
        ptr = *base;
    }
    (ptr, offset)
}

impl AliasAnalysis for BasicAliasAnalysis {
    fn alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        if a.ptr == b.ptr {
            return AliasResult::MustAlias;
        }

        let (base_a, offset_a) = decompose(func, a.ptr);
        let (base_b, offset_b) = decompose(func, b.ptr);
        let object_a = UnderlyingObject::of(func, base_a);
        let object_b = UnderlyingObject::of(func, base_b);

        // Distinct `global_addr` instructions may name the same global
        let same_object = base_a == base_b
            || matches!(
                (object_a, object_b),
                (UnderlyingObject::Global(x), UnderlyingObject::Global(y)) if x == y
            );
        if same_object {
            let (Some(offset_a), Some(offset_b)) = (offset_a, offset_b) else {
                return AliasResult::MayAlias;
            };
            if offset_a == offset_b {
                return AliasResult::MustAlias;
            }

            // Order the two accesses by their starting offset, the first one must end before the
            // second one begins
            let (low_offset, low_size, high_offset) = if offset_a < offset_b {
                (offset_a, a.size, offset_b)
            } else {
                (offset_b, b.size, offset_a)
            };
            let Some(low_size) = low_size.value() else {
                return AliasResult::MayAlias;
            };
            let gap = high_offset.abs_diff(low_offset);
            return if low_size <= gap {
                AliasResult::NoAlias
            } else {
                AliasResult::PartialAlias
            };
        }

        match (object_a, object_b) {
            (a, b) if a.is_identified() && b.is_identified() => AliasResult::NoAlias,
            // Parameters never point into the stack slots of this function
            (UnderlyingObject::Alloca(_), UnderlyingObject::Param)
            | (UnderlyingObject::Param, UnderlyingObject::Alloca(_)) => AliasResult::NoAlias,
            _ => AliasResult::MayAlias,
        }
    }

    fn points_to_constant_memory(
        &self,
        func: &Function,
        loc: &MemoryLocation,
        or_local: bool,
    ) -> bool {
        let (base, _) = decompose(func, loc.ptr);
        match UnderlyingObject::of(func, base) {
            UnderlyingObject::Global(global) => func.globals[global].constant,
            UnderlyingObject::Alloca(_) => or_local,
            UnderlyingObject::Param | UnderlyingObject::Unknown => false,
        }
    }
}
