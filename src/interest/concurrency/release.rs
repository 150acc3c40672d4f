//! Find the instructions that release the guard of a lock site.
//!
//! Starting from the guard value, def-use chains are followed through
//! loads, stores to stack slots, pointer casts and `Result` unwrapping
//! until a drop call is reached. The tracer runs a worklist to a fixed point,
//! so the shape of the def-use graph never affects termination.
use std::collections::BTreeSet;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;

use super::lock::LockInfo;
use crate::analysis::ir::{InstId, InstKind, IntPredicate, Module, ValueRef};

pub type ReleaseSet = BTreeSet<InstId>;

/// Dropping a guard by scope end (`drop_in_place`) or explicitly (`mem::drop`).
static RELEASE_API_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(std::concat!(
        r"^(",
        r"_ZN4core3ptr18real_drop_in_place17h",
        r"|_ZN4core3ptr13drop_in_place17h",
        r"|_ZN4core3mem4drop17h",
        r"|<?core::ptr::(real_)?drop_in_place(::|<|$)",
        r"|<?core::mem::drop(::|<|$)",
        r")"
    ))
    .unwrap()
});

static MANUAL_DROP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(_ZN4core3mem4drop17h|<?core::mem::drop(::|<|$))").unwrap()
});

/// `Result<Guard, _>` to `Guard`.
static UNWRAP_API_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(std::concat!(
        r"^(",
        r"_ZN4core6result19Result\$LT\$T\$C\$E\$GT\$",
        r"(6unwrap|9unwrap_or|14unwrap_or_else|17unwrap_or_default|6expect)17h",
        r"|<?core::result::Result<.+>::",
        r"(unwrap|unwrap_or|unwrap_or_else|unwrap_or_default|expect)(::|$)",
        r")"
    ))
    .unwrap()
});

pub fn is_release_api(name: &str) -> bool {
    RELEASE_API_REGEX.is_match(name)
}

pub fn is_manual_drop(name: &str) -> bool {
    MANUAL_DROP_REGEX.is_match(name)
}

pub fn is_unwrap_api(name: &str) -> bool {
    UNWRAP_API_REGEX.is_match(name)
}

/// How a value in the worklist relates to the guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Relation {
    /// The guard itself or the result of unwrapping it.
    Guard,
    /// A stack object the guard's payload was moved into.
    Relocated,
}

pub struct ReleaseTracer<'a> {
    module: &'a Module,
    lock_inst: InstId,
    worklist: Vec<(ValueRef, Relation)>,
    visited: FxHashSet<(ValueRef, Relation)>,
    releases: ReleaseSet,
}

impl<'a> ReleaseTracer<'a> {
    pub fn new(module: &'a Module, lock: &LockInfo) -> Self {
        Self {
            module,
            lock_inst: lock.lock_inst,
            worklist: vec![(lock.result, Relation::Guard)],
            visited: FxHashSet::default(),
            releases: ReleaseSet::new(),
        }
    }

    /// Consumes the tracer and returns every release point found.
    pub fn trace(mut self) -> ReleaseSet {
        while let Some((value, relation)) = self.worklist.pop() {
            if !self.visited.insert((value, relation)) {
                continue;
            }
            match relation {
                Relation::Guard => self.visit_guard(value),
                Relation::Relocated => self.visit_relocated(value),
            }
        }
        self.releases
    }

    fn users(&self, value: ValueRef) -> impl Iterator<Item = InstId> + 'a {
        let module = self.module;
        let lock_inst = self.lock_inst;
        module
            .users(value)
            .iter()
            .copied()
            .filter(move |user| *user != lock_inst)
    }

    fn is_release(&self, inst: InstId) -> bool {
        self.module.called_name(inst).map_or(false, is_release_api)
    }

    /// Release calls among the users of `value`.
    fn add_release_users(&mut self, value: ValueRef) {
        let releases: Vec<InstId> = self.users(value).filter(|u| self.is_release(*u)).collect();
        self.releases.extend(releases);
    }

    /// Release calls among the users of the loads of `value`.
    fn add_reloaded_releases(&mut self, value: ValueRef) {
        let loads: Vec<InstId> = self
            .users(value)
            .filter(|u| matches!(self.module.inst(*u).kind, InstKind::Load { .. }))
            .collect();
        for load in loads {
            self.add_release_users(load.into());
        }
    }

    fn visit_guard(&mut self, guard: ValueRef) {
        let module = self.module;
        let users: Vec<InstId> = self.users(guard).collect();
        for user in users {
            if self.is_release(user) {
                self.releases.insert(user);
                continue;
            }
            match &module.inst(user).kind {
                InstKind::Load { .. } => self.add_release_users(user.into()),
                InstKind::Store { value, ptr } if *value == guard => {
                    let slot = *ptr;
                    self.add_release_users(slot);
                    self.add_reloaded_releases(slot);
                }
                InstKind::Cast { .. } => {
                    self.visit_discriminant_checks(user);
                    self.visit_payload_moves(user);
                }
                InstKind::Call { .. } | InstKind::Invoke { .. }
                    if module.called_name(user).map_or(false, is_unwrap_api) =>
                {
                    let inner = if module.is_void(module.inst(user).ty) {
                        match module.call_args(user).and_then(|args| args.first()) {
                            Some(out) => module.underlying_object(*out),
                            None => {
                                debug!("unwrap without arguments at {}", module.describe(user));
                                continue;
                            }
                        }
                    } else {
                        ValueRef::Inst(user)
                    };
                    self.worklist.push((inner, Relation::Guard));
                }
                _ => {}
            }
        }
    }

    /// `if let Ok(guard) = result` lowers to a load of the discriminant
    /// through a cast, a compare against zero and a conditional branch;
    /// the guard is released at the start of the `Err` successor.
    fn visit_discriminant_checks(&mut self, cast: InstId) {
        let loads: Vec<InstId> = self
            .users(cast.into())
            .filter(|u| matches!(self.module.inst(*u).kind, InstKind::Load { .. }))
            .collect();
        for load in loads {
            let zero = ValueRef::ConstInt(0);
            let cmps: Vec<(InstId, IntPredicate)> = self
                .users(load.into())
                .filter_map(|u| match self.module.inst(u).kind {
                    InstKind::ICmp { pred, lhs, rhs } if lhs == zero || rhs == zero => {
                        Some((u, pred))
                    }
                    InstKind::ICmp { .. } => {
                        debug!("discriminant compared to non-zero at {}", self.module.describe(u));
                        None
                    }
                    _ => None,
                })
                .collect();
            for (cmp, pred) in cmps {
                let branches: Vec<InstId> = self.users(cmp.into()).collect();
                for br in branches {
                    let (then_dest, else_dest) = match self.module.inst(br).kind {
                        InstKind::CondBr {
                            then_dest,
                            else_dest,
                            ..
                        } => (then_dest, else_dest),
                        _ => continue,
                    };
                    let nonzero = match pred {
                        IntPredicate::Eq => else_dest,
                        IntPredicate::Ne => then_dest,
                        IntPredicate::Other => {
                            debug!("unexpected discriminant check at {}", self.module.describe(cmp));
                            continue;
                        }
                    };
                    if let Some(first) = self.module.first_non_phi_or_dbg(nonzero) {
                        self.releases.insert(first);
                    }
                }
            }
        }
    }

    /// The guard payload at field `[0, 1]` of a `Result` may be dropped in
    /// place, or moved out through `[0, 0]` into another stack object that
    /// is dropped later.
    fn visit_payload_moves(&mut self, cast: InstId) {
        let payloads = self.field_users(cast.into(), &[0, 1]);
        for payload in payloads {
            self.add_release_users(payload.into());
            for inner in self.field_users(payload.into(), &[0, 0]) {
                let loads: Vec<InstId> = self
                    .users(inner.into())
                    .filter(|u| matches!(self.module.inst(*u).kind, InstKind::Load { .. }))
                    .collect();
                for load in loads {
                    let stores: Vec<InstId> = self.users(load.into()).collect();
                    for store in stores {
                        let dest = match self.module.inst(store).kind {
                            InstKind::Store { value, ptr } if value == ValueRef::Inst(load) => ptr,
                            _ => continue,
                        };
                        let object = self.module.underlying_object(dest);
                        let relocated = self.module.users(object).iter().any(|u| {
                            matches!(self.module.inst(*u).kind, InstKind::FieldAddr { .. })
                        });
                        if relocated {
                            self.worklist.push((object, Relation::Relocated));
                        }
                    }
                }
            }
        }
    }

    fn visit_relocated(&mut self, object: ValueRef) {
        self.add_release_users(object);
        self.add_reloaded_releases(object);
    }

    fn field_users(&self, value: ValueRef, indices: &[i64]) -> Vec<InstId> {
        self.users(value)
            .filter(|u| self.module.field_indices(*u) == Some(indices))
            .collect()
    }
}

/// Convenience wrapper around `ReleaseTracer`.
pub fn trace_releases(module: &Module, lock: &LockInfo) -> ReleaseSet {
    ReleaseTracer::new(module, lock).trace()
}
