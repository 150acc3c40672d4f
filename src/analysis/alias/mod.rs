//! Alias queries between two pointer values of the same function.
//! The detectors only depend on the `AliasAnalysis` trait; `BasicAliasAnalysis`
//! is a cheap structural implementation that looks through casts and
//! constant field address computations.
use smallvec::SmallVec;

use crate::analysis::ir::{InstKind, Module, ValueRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    MustAlias,
}

pub trait AliasAnalysis {
    /// `a` and `b` must belong to the same function.
    fn alias(&self, module: &Module, a: ValueRef, b: ValueRef) -> AliasResult;

    fn must_alias(&self, module: &Module, a: ValueRef, b: ValueRef) -> bool {
        self.alias(module, a, b) == AliasResult::MustAlias
    }

    fn may_alias(&self, module: &Module, a: ValueRef, b: ValueRef) -> bool {
        self.alias(module, a, b) != AliasResult::NoAlias
    }
}

/// A pointer decomposed into the object it is derived from and the
/// constant field path leading to it.
#[derive(Debug, PartialEq, Eq)]
struct Decomposed {
    object: ValueRef,
    path: SmallVec<[i64; 4]>,
    /// False once an offset we cannot express as a field path was seen.
    exact: bool,
}

fn decompose(module: &Module, value: ValueRef) -> Decomposed {
    // Field address computations are collected innermost first.
    let mut segments: Vec<&[i64]> = Vec::new();
    let mut cur = value;
    while let ValueRef::Inst(id) = cur {
        match &module.inst(id).kind {
            InstKind::Cast { value } => cur = *value,
            InstKind::FieldAddr { base, indices } => {
                segments.push(indices);
                cur = *base;
            }
            _ => break,
        }
    }
    let mut path = SmallVec::new();
    let mut exact = true;
    for (i, indices) in segments.iter().rev().enumerate() {
        match indices.split_first() {
            Some((first, rest)) if i > 0 => {
                if *first != 0 {
                    exact = false;
                }
                path.extend_from_slice(rest);
            }
            _ => path.extend_from_slice(indices),
        }
    }
    Decomposed {
        object: cur,
        path,
        exact,
    }
}

fn is_identified_object(module: &Module, value: ValueRef) -> bool {
    match value {
        ValueRef::Global(_) => true,
        ValueRef::Inst(id) => matches!(module.inst(id).kind, InstKind::Alloca),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct BasicAliasAnalysis;

impl AliasAnalysis for BasicAliasAnalysis {
    fn alias(&self, module: &Module, a: ValueRef, b: ValueRef) -> AliasResult {
        if a == b {
            return AliasResult::MustAlias;
        }
        let da = decompose(module, a);
        let db = decompose(module, b);
        if da.object != db.object {
            if is_identified_object(module, da.object) && is_identified_object(module, db.object)
            {
                return AliasResult::NoAlias;
            }
            return AliasResult::MayAlias;
        }
        if !(da.exact && db.exact) {
            return AliasResult::MayAlias;
        }
        if da.path == db.path {
            return AliasResult::MustAlias;
        }
        // A field overlaps every path it is a prefix of.
        let common = da.path.len().min(db.path.len());
        if da.path[..common] == db.path[..common] {
            AliasResult::MayAlias
        } else {
            AliasResult::NoAlias
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ir::ModuleBuilder;

    #[test]
    fn test_basic_alias_analysis() {
        let mut b = ModuleBuilder::new();
        let i32_ty = b.int(32);
        let mutex = b.opaque("Mutex");
        let mutex_ptr = b.pointer(mutex);
        let foo = b.struct_type("Foo", &[mutex, mutex, i32_ty]);
        let foo_ptr = b.pointer(foo);
        let void = b.void();
        let f = b.function("f", &[foo_ptr], void);
        let bb = b.block(f, "start");
        let this = b.arg(f, 0);
        let m0 = b.field_addr(bb, this, &[0, 0], mutex_ptr);
        let m0_again = b.field_addr(bb, this, &[0, 0], mutex_ptr);
        let m0_cast = b.cast(bb, m0_again.into(), mutex_ptr);
        let m1 = b.field_addr(bb, this, &[0, 1], mutex_ptr);
        let slot_a = b.alloca(bb, mutex);
        let slot_b = b.alloca(bb, mutex);
        let loaded = b.load(bb, this, foo_ptr);
        b.ret(bb);
        let m = b.finish();

        let aa = BasicAliasAnalysis;
        assert_eq!(aa.alias(&m, m0.into(), m0_again.into()), AliasResult::MustAlias);
        assert!(aa.must_alias(&m, m0.into(), m0_cast.into()));
        assert_eq!(aa.alias(&m, m0.into(), m1.into()), AliasResult::NoAlias);
        assert_eq!(aa.alias(&m, m0.into(), this), AliasResult::MayAlias);
        assert_eq!(aa.alias(&m, slot_a.into(), slot_b.into()), AliasResult::NoAlias);
        assert!(aa.may_alias(&m, loaded.into(), slot_a.into()));
    }

    #[test]
    fn test_nested_field_paths() {
        let mut b = ModuleBuilder::new();
        let mutex = b.opaque("Mutex");
        let mutex_ptr = b.pointer(mutex);
        let inner = b.struct_type("Inner", &[mutex, mutex]);
        let inner_ptr = b.pointer(inner);
        let outer = b.struct_type("Outer", &[inner, inner]);
        let outer_ptr = b.pointer(outer);
        let void = b.void();
        let f = b.function("f", &[outer_ptr], void);
        let bb = b.block(f, "start");
        let this = b.arg(f, 0);
        let flat = b.field_addr(bb, this, &[0, 1, 0], mutex_ptr);
        let step = b.field_addr(bb, this, &[0, 1], inner_ptr);
        let nested = b.field_addr(bb, step.into(), &[0, 0], mutex_ptr);
        let offset = b.field_addr(bb, step.into(), &[1, 0], mutex_ptr);
        b.ret(bb);
        let m = b.finish();

        let aa = BasicAliasAnalysis;
        assert!(aa.must_alias(&m, flat.into(), nested.into()));
        assert_eq!(aa.alias(&m, flat.into(), offset.into()), AliasResult::MayAlias);
    }
}
