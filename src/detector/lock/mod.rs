//! DoubleLockDetector: detects a lock acquired again while its guard may still be alive.
//!
//! Lock sites are grouped by lock identity (see `LockGroups`).
//! For every lock of a group with more than one member, the control flow
//! after the lock is walked until the guard is released. Reaching a lock of
//! the same group on the way is a double lock.
//! Locks with a structural identity may be re-acquired in another function,
//! so calls met on the walk are followed through the call graph.
pub mod report;

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::alias::AliasAnalysis;
use crate::analysis::callgraph::CallGraph;
use crate::analysis::ir::{BlockId, FunctionId, InstId, Module};
use crate::config::DetectorConfig;
use crate::detector::report::{Report, ReportContent};
use crate::interest::concurrency::lock::{collect_lock_sites, Access, LockFlavor, LockInfo};
use crate::interest::concurrency::release::{trace_releases, ReleaseSet};
use crate::interest::concurrency::source::LockGroups;
use report::DoubleLockDiagnosis;

/// Locks of one group that may be acquired again, by lock instruction.
type AliasSet = BTreeMap<InstId, LockInfo>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WalkState {
    Propagating,
    StoppedByAlias,
    StoppedByRelease,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    /// Only the function of the first lock.
    Local,
    /// Also the functions reachable through calls.
    Global,
}

/// Call-graph search from one call site for a function acquiring an aliased lock.
struct CallTrace {
    visited: FxHashSet<FunctionId>,
    worklist: Vec<FunctionId>,
    /// The call site through which each function was first reached.
    parent_call_site: FxHashMap<FunctionId, InstId>,
}

impl CallTrace {
    fn new(call_site: InstId, callee: FunctionId) -> Self {
        let mut visited = FxHashSet::default();
        visited.insert(callee);
        let mut parent_call_site = FxHashMap::default();
        parent_call_site.insert(callee, call_site);
        Self {
            visited,
            worklist: vec![callee],
            parent_call_site,
        }
    }

    fn search(
        &mut self,
        callgraph: &CallGraph,
        alias_functions: &BTreeMap<FunctionId, Vec<LockInfo>>,
    ) -> Option<FunctionId> {
        while let Some(func) = self.worklist.pop() {
            if alias_functions.contains_key(&func) {
                return Some(func);
            }
            if let Some(callsites) = callgraph.callsites_of(func) {
                for (site, callee) in callsites {
                    if self.visited.insert(*callee) {
                        self.parent_call_site.insert(*callee, *site);
                        self.worklist.push(*callee);
                    }
                }
            }
        }
        None
    }

    /// Call sites leading from `root` to `found`, outermost first.
    fn backtrace(&self, module: &Module, root: FunctionId, found: FunctionId) -> Vec<InstId> {
        let mut chain = Vec::new();
        let mut seen = FxHashSet::default();
        let mut cur = found;
        while let Some(site) = self.parent_call_site.get(&cur) {
            chain.push(*site);
            if !seen.insert(cur) {
                break;
            }
            cur = module.function_of(*site);
            if cur == root {
                break;
            }
        }
        chain.reverse();
        chain
    }
}

/// Detect doublelock.
pub struct DoubleLockDetector<'a> {
    module: &'a Module,
    alias_analysis: &'a dyn AliasAnalysis,
    config: &'a DetectorConfig,
    callgraph: CallGraph,
    lock_sites: usize,
}

impl<'a> DoubleLockDetector<'a> {
    pub fn new(
        module: &'a Module,
        alias_analysis: &'a dyn AliasAnalysis,
        config: &'a DetectorConfig,
    ) -> Self {
        let mut callgraph = CallGraph::new();
        callgraph.analyze(module);
        Self {
            module,
            alias_analysis,
            config,
            callgraph,
            lock_sites: 0,
        }
    }

    pub fn callgraph(&self) -> &CallGraph {
        &self.callgraph
    }

    /// Number of lock sites seen by the last `detect`.
    pub fn lock_sites(&self) -> usize {
        self.lock_sites
    }

    /// Detect doublelock for every enabled lock flavor and returns bug reports.
    pub fn detect(&mut self) -> Vec<Report> {
        let sites = collect_lock_sites(self.module, self.config.flavors);
        self.lock_sites = sites.len();
        let mut reports = Vec::new();
        for unparsed in &sites.unparsed {
            reports.push(Report::UnparsedLockSite(ReportContent::new(
                "UnparsedLockSite".to_owned(),
                "Unknown".to_owned(),
                format!(
                    "{} at {}: {}",
                    unparsed.kind,
                    self.module.describe(unparsed.inst),
                    unparsed.error
                ),
                "The lock call does not have the expected arguments and is not analyzed".to_owned(),
            )));
        }
        for flavor in LockFlavor::ALL {
            if !self.config.is_enabled(flavor) {
                continue;
            }
            if let Some(locks) = sites.of_flavor(flavor) {
                info!("{:?}: {} lock sites", flavor, locks.len());
                self.detect_flavor(locks, &mut reports);
            }
        }
        reports
    }

    fn detect_flavor(&self, locks: &BTreeMap<InstId, LockInfo>, reports: &mut Vec<Report>) {
        let groups = LockGroups::build(self.module, locks);
        let releases: FxHashMap<InstId, ReleaseSet> = locks
            .values()
            .map(|info| (info.lock_inst, trace_releases(self.module, info)))
            .collect();
        let empty = ReleaseSet::new();
        for group in groups.intra.values().flat_map(BTreeMap::values) {
            if group.len() < 2 {
                continue;
            }
            for first in group.values() {
                let aliases: AliasSet = group
                    .values()
                    .filter(|other| {
                        other.lock_inst != first.lock_inst
                            && self.alias_analysis.must_alias(
                                self.module,
                                first.lock_target,
                                other.lock_target,
                            )
                    })
                    .map(|other| (other.lock_inst, *other))
                    .collect();
                if aliases.is_empty() {
                    continue;
                }
                let release = releases.get(&first.lock_inst).unwrap_or(&empty);
                self.check_local(first, &aliases, release, reports);
            }
        }
        for group in groups.inter.values() {
            if group.len() < 2 {
                continue;
            }
            for first in group.values() {
                let aliases: AliasSet = group
                    .iter()
                    .filter(|(inst, _)| **inst != first.lock_inst)
                    .map(|(inst, other)| (*inst, *other))
                    .collect();
                let release = releases.get(&first.lock_inst).unwrap_or(&empty);
                self.check_global(first, &aliases, release, reports);
            }
        }
    }

    fn is_suppressed(&self, first: &LockInfo) -> bool {
        let func = self.module.function_of(first.lock_inst);
        let name = &self.module.function(func).name;
        if self.config.is_suppressed(name) {
            debug!("{} is suppressed", name);
            return true;
        }
        false
    }

    /// Check a lock against aliases in its own function.
    pub fn check_local(
        &self,
        first: &LockInfo,
        aliases: &AliasSet,
        release: &ReleaseSet,
        reports: &mut Vec<Report>,
    ) {
        if self.is_suppressed(first) {
            return;
        }
        self.walk(first, aliases, release, Scope::Local, reports);
    }

    /// Check a lock against aliases anywhere reachable through calls.
    pub fn check_global(
        &self,
        first: &LockInfo,
        aliases: &AliasSet,
        release: &ReleaseSet,
        reports: &mut Vec<Report>,
    ) {
        if self.is_suppressed(first) {
            return;
        }
        self.walk(first, aliases, release, Scope::Global, reports);
    }

    /// Breadth-first walk of the blocks after `first`, each block entered once.
    fn walk(
        &self,
        first: &LockInfo,
        aliases: &AliasSet,
        release: &ReleaseSet,
        scope: Scope,
        reports: &mut Vec<Report>,
    ) {
        let module = self.module;
        let lock_bb = module.inst(first.lock_inst).block;
        let start = module
            .block(lock_bb)
            .insts
            .iter()
            .position(|inst| *inst == first.lock_inst)
            .map_or(0, |pos| pos + 1);
        let alias_functions = match scope {
            Scope::Global => self.alias_functions(first, aliases),
            Scope::Local => BTreeMap::new(),
        };
        let mut worklist: VecDeque<(BlockId, usize)> = VecDeque::new();
        let mut enqueued: FxHashSet<BlockId> = FxHashSet::default();
        worklist.push_back((lock_bb, start));
        enqueued.insert(lock_bb);
        while let Some((bb, start)) = worklist.pop_front() {
            let mut state = WalkState::Propagating;
            for inst in module.block(bb).insts.iter().skip(start) {
                if module.skip_inst(*inst) {
                    continue;
                }
                state = self.visit(first, *inst, aliases, release, &alias_functions, reports);
                if state != WalkState::Propagating {
                    break;
                }
            }
            if state != WalkState::Propagating {
                continue;
            }
            for succ in module.successors(bb) {
                if module.is_landing_pad_block(succ) {
                    continue;
                }
                if enqueued.insert(succ) {
                    worklist.push_back((succ, 0));
                }
            }
        }
    }

    fn visit(
        &self,
        first: &LockInfo,
        inst: InstId,
        aliases: &AliasSet,
        release: &ReleaseSet,
        alias_functions: &BTreeMap<FunctionId, Vec<LockInfo>>,
        reports: &mut Vec<Report>,
    ) -> WalkState {
        if let Some(second) = aliases.get(&inst) {
            if first.kind.nests_with(second.kind) {
                return WalkState::Propagating;
            }
            reports.push(self.report(first, &[*second], &[]));
            return WalkState::StoppedByAlias;
        }
        if release.contains(&inst) {
            return WalkState::StoppedByRelease;
        }
        if alias_functions.is_empty() {
            return WalkState::Propagating;
        }
        let caller = self.module.function_of(inst);
        let callee = match self.callgraph.callee_at(caller, inst) {
            Some(callee) => callee,
            None => return WalkState::Propagating,
        };
        let mut trace = CallTrace::new(inst, callee);
        match trace.search(&self.callgraph, alias_functions) {
            Some(found) => {
                let root = self.module.function_of(first.lock_inst);
                let callchain = trace.backtrace(self.module, root, found);
                reports.push(self.report(first, &alias_functions[&found], &callchain));
                WalkState::StoppedByAlias
            }
            None => WalkState::Propagating,
        }
    }

    /// Functions directly acquiring one of `aliases`, with those locks.
    /// Locks that nest with `first` are left out.
    fn alias_functions(
        &self,
        first: &LockInfo,
        aliases: &AliasSet,
    ) -> BTreeMap<FunctionId, Vec<LockInfo>> {
        let mut functions: BTreeMap<FunctionId, Vec<LockInfo>> = BTreeMap::new();
        for second in aliases.values() {
            if first.kind.nests_with(second.kind) {
                continue;
            }
            functions
                .entry(self.module.function_of(second.lock_inst))
                .or_default()
                .push(*second);
        }
        functions
    }

    fn report(&self, first: &LockInfo, seconds: &[LockInfo], callchain: &[InstId]) -> Report {
        let shared = first.kind.access() == Access::Shared
            && seconds.iter().all(|s| s.kind.access() == Access::Shared);
        let possibility = if shared { "Possibly" } else { "Probably" };
        let diagnosis = DoubleLockDiagnosis::new(self.module, first, seconds, callchain);
        Report::DoubleLock(ReportContent::new(
            "DoubleLock".to_owned(),
            possibility.to_owned(),
            diagnosis,
            "The first lock is not released when acquiring the second lock".to_owned(),
        ))
    }
}
