//! ManualDropAuditor: list the explicit `drop(guard)` calls of each lock site.
//!
//! Lock calls are recognized by a looser, name-based heuristic than the
//! double-lock detector uses, so wrappers such as `HandyRwLock::rl` are
//! covered as well.
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::analysis::ir::{InstId, InstKind, Module, ValueRef};
use crate::detector::report::{Report, ReportContent};
use crate::interest::concurrency::release::is_manual_drop;

static LOCK_LIKE_REGEX: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(Mutex|mutex).*(\$GT\$4lock17h|>::lock(::|$))").unwrap(),
        Regex::new(r"(RwLock|rwlock).*(\$GT\$(4read|5write)17h|>::(read|write)(::|$))").unwrap(),
        Regex::new(r"HandyRwLock.*(2rl17h|2wl17h|::(rl|wl)(::|$))").unwrap(),
    ]
});

static RAW_LOCK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(raw_mutex|raw_rwlock|RawMutex|RawRwLock)").unwrap());

pub fn is_lock_like(name: &str) -> bool {
    !RAW_LOCK_REGEX.is_match(name) && LOCK_LIKE_REGEX.iter().any(|regex| regex.is_match(name))
}

#[derive(Debug, Serialize)]
pub struct ManualDropDiagnosis {
    pub function: String,
    pub lock: String,
    pub drops: Vec<String>,
}

impl fmt::Display for ManualDropDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Manual Drop! Lock:")?;
        writeln!(f, " {}", self.lock)?;
        writeln!(f, "Drop(s):")?;
        for drop in &self.drops {
            writeln!(f, " {}", drop)?;
        }
        Ok(())
    }
}

pub struct ManualDropAuditor<'a> {
    module: &'a Module,
}

impl<'a> ManualDropAuditor<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module }
    }

    /// The guard of a lock-like call: the out-parameter of a void call with
    /// at least two arguments, the call itself otherwise.
    fn guard_of(&self, inst: InstId) -> Option<ValueRef> {
        let args = self.module.call_args(inst)?;
        if self.module.is_void(self.module.inst(inst).ty) {
            if args.len() < 2 {
                warn!("cannot parse lock call at {}", self.module.describe(inst));
                return None;
            }
            Some(args[0])
        } else {
            Some(ValueRef::Inst(inst))
        }
    }

    /// Breadth-first search from the guard to the `mem::drop` calls consuming it.
    pub fn drops_of(&self, lock: InstId, guard: ValueRef) -> BTreeSet<InstId> {
        let mut drops = BTreeSet::new();
        let mut visited = FxHashSet::default();
        let mut worklist = VecDeque::new();
        worklist.push_back(guard);
        visited.insert(guard);
        while let Some(value) = worklist.pop_front() {
            for user in self.module.users(value) {
                if *user == lock {
                    continue;
                }
                if self.module.called_name(*user).map_or(false, is_manual_drop) {
                    drops.insert(*user);
                    continue;
                }
                let next = match &self.module.inst(*user).kind {
                    InstKind::Store { value: stored, ptr } if *stored == value => *ptr,
                    InstKind::Store { .. } => continue,
                    _ => ValueRef::Inst(*user),
                };
                if visited.insert(next) {
                    worklist.push_back(next);
                }
            }
        }
        drops
    }

    pub fn audit(&self) -> Vec<Report> {
        let mut reports = Vec::new();
        for func in self.module.function_ids() {
            if self.module.function(func).is_declaration() {
                continue;
            }
            for inst in self.module.insts_of(func) {
                if !self.module.called_name(inst).map_or(false, is_lock_like) {
                    continue;
                }
                let guard = match self.guard_of(inst) {
                    Some(guard) => guard,
                    None => continue,
                };
                let drops = self.drops_of(inst, guard);
                debug!("{}: {} manual drop(s)", self.module.describe(inst), drops.len());
                if drops.is_empty() {
                    continue;
                }
                let diagnosis = ManualDropDiagnosis {
                    function: self.module.function(func).name.clone(),
                    lock: self.module.describe(inst),
                    drops: drops.iter().map(|d| self.module.describe(*d)).collect(),
                };
                reports.push(Report::ManualDrop(ReportContent::new(
                    "ManualDrop".to_owned(),
                    "Unknown".to_owned(),
                    diagnosis,
                    "The guard is released by an explicit drop".to_owned(),
                )));
            }
        }
        reports
    }
}
