//! Structural identity of lock objects.
//!
//! Two locks share a `MutexSource` when they are the same field of the same
//! struct type, whichever instance of the struct they belong to.
//! Locks whose identity cannot be resolved are grouped per function by the
//! static type of the lock object instead.
use std::collections::BTreeMap;

use log::debug;
use smallvec::SmallVec;

use super::lock::LockInfo;
use crate::analysis::ir::{FunctionId, InstId, InstKind, Module, TypeId, ValueRef};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexSource {
    /// The enclosing struct type.
    pub aggregate: TypeId,
    /// Field path inside `aggregate`, empty when the lock is the struct
    /// itself seen through a cast.
    pub indices: SmallVec<[i64; 4]>,
}

impl MutexSource {
    pub fn describe(&self, module: &Module) -> String {
        let path = self
            .indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}[{}]", module.type_name(self.aggregate), path)
    }
}

/// The struct type `value` points to, looking through pointer casts.
fn pointee_struct(module: &Module, value: ValueRef) -> Option<TypeId> {
    let value = module.strip_pointer_casts(value);
    let pointee = module.pointee(module.value_type(value))?;
    if module.is_struct(pointee) {
        Some(pointee)
    } else {
        None
    }
}

/// Resolve the structural identity of a lock object from its definition.
pub fn trace_mutex_source(module: &Module, target: ValueRef) -> Option<MutexSource> {
    let def = target.as_inst()?;
    match &module.inst(def).kind {
        InstKind::FieldAddr { base, indices } => {
            let aggregate = pointee_struct(module, *base)?;
            Some(MutexSource {
                aggregate,
                indices: indices.iter().copied().collect(),
            })
        }
        InstKind::Cast { value } => {
            let aggregate = pointee_struct(module, *value)?;
            Some(MutexSource {
                aggregate,
                indices: SmallVec::new(),
            })
        }
        _ => None,
    }
}

/// Lock sites of one flavor grouped by lock identity.
#[derive(Debug, Default)]
pub struct LockGroups {
    /// Locks with a resolved `MutexSource`, checked across functions.
    pub inter: BTreeMap<MutexSource, BTreeMap<InstId, LockInfo>>,
    /// The remaining locks by owning function and static type of the lock.
    pub intra: BTreeMap<FunctionId, BTreeMap<TypeId, BTreeMap<InstId, LockInfo>>>,
}

impl LockGroups {
    pub fn build(module: &Module, locks: &BTreeMap<InstId, LockInfo>) -> Self {
        let mut groups = Self::default();
        for (inst, info) in locks {
            match trace_mutex_source(module, info.lock_target) {
                Some(source) => {
                    debug!(
                        "{} locks {}",
                        module.describe(*inst),
                        source.describe(module)
                    );
                    groups.inter.entry(source).or_default().insert(*inst, *info);
                }
                None => {
                    let func = module.function_of(*inst);
                    let ty = module.value_type(info.lock_target);
                    groups
                        .intra
                        .entry(func)
                        .or_default()
                        .entry(ty)
                        .or_default()
                        .insert(*inst, *info);
                }
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ir::ModuleBuilder;
    use crate::interest::concurrency::lock::LockApiKind;

    #[test]
    fn test_mutex_source_is_structural() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let i32_ty = b.int(32);
        let mutex = b.opaque("Mutex");
        let mutex_ptr = b.pointer(mutex);
        let foo = b.struct_type("Foo", &[i32_ty, mutex, mutex]);
        let foo_ptr = b.pointer(foo);
        let i8_ty = b.int(8);
        let i8_ptr = b.pointer(i8_ty);
        let f = b.function("f", &[foo_ptr], void);
        let g = b.function("g", &[foo_ptr, i8_ptr], void);
        let f_this = b.arg(f, 0);
        let g_this = b.arg(g, 0);
        let g_raw = b.arg(g, 1);
        let fb = b.block(f, "start");
        let in_f = b.field_addr(fb, f_this, &[0, 1], mutex_ptr);
        let other_field = b.field_addr(fb, f_this, &[0, 2], mutex_ptr);
        let whole = b.cast(fb, f_this, mutex_ptr);
        b.ret(fb);
        let gb = b.block(g, "start");
        let erased = b.cast(gb, g_this, i8_ptr);
        let in_g = b.field_addr(gb, erased.into(), &[0, 1], mutex_ptr);
        let opaque_base = b.field_addr(gb, g_raw, &[0], mutex_ptr);
        b.ret(gb);
        let m = b.finish();

        let src_f = trace_mutex_source(&m, in_f.into()).unwrap();
        let src_g = trace_mutex_source(&m, in_g.into()).unwrap();
        assert_eq!(src_f, src_g);
        assert_eq!(src_f.aggregate, foo);
        assert_eq!(src_f.indices.as_slice(), &[0, 1]);
        assert_eq!(src_f.describe(&m), "Foo[0, 1]");
        assert_ne!(trace_mutex_source(&m, other_field.into()), Some(src_f));
        let whole = trace_mutex_source(&m, whole.into()).unwrap();
        assert!(whole.indices.is_empty());
        assert_eq!(whole.aggregate, foo);
        assert_eq!(trace_mutex_source(&m, opaque_base.into()), None);
        assert_eq!(trace_mutex_source(&m, f_this), None);
    }

    #[test]
    fn test_lock_groups() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let mutex = b.opaque("Mutex");
        let mutex_ptr = b.pointer(mutex);
        let guard = b.opaque("Guard");
        let guard_ptr = b.pointer(guard);
        let foo = b.struct_type("Foo", &[mutex]);
        let foo_ptr = b.pointer(foo);
        let lock = b.function("lock_api::mutex::Mutex<R,T>::lock", &[mutex_ptr], guard_ptr);
        let f = b.function("f", &[foo_ptr, mutex_ptr], void);
        let bb = b.block(f, "start");
        let this = b.arg(f, 0);
        let raw = b.arg(f, 1);
        let field = b.field_addr(bb, this, &[0, 0], mutex_ptr);
        let l1 = b.call(bb, lock, &[field.into()]);
        let l2 = b.call(bb, lock, &[raw]);
        let l3 = b.call(bb, lock, &[raw]);
        b.ret(bb);
        let m = b.finish();

        let locks: BTreeMap<InstId, LockInfo> = [l1, l2, l3]
            .iter()
            .map(|inst| {
                let info = LockInfo::parse(&m, *inst, LockApiKind::LockApiMutexLock).unwrap();
                (*inst, info)
            })
            .collect();
        let groups = LockGroups::build(&m, &locks);
        assert_eq!(groups.inter.len(), 1);
        assert_eq!(groups.inter.values().next().unwrap().len(), 1);
        let local = &groups.intra[&f];
        assert_eq!(local.len(), 1);
        assert_eq!(
            local[&mutex_ptr].keys().copied().collect::<Vec<_>>(),
            vec![l2, l3]
        );
    }
}
