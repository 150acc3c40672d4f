//! Recognize lock acquisitions and extract the lock object and the guard.
//!
//! A call is a lock site when its callee symbol matches one row of
//! `LOCK_API_REGEX`, in either legacy-mangled or demangled form.
//! The row also tells where the lock object and the guard live:
//! std locks may return their guard through an out-parameter,
//! lock_api locks always return it.
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::analysis::ir::{InstId, Module, ValueRef};
use crate::config::LockFlavors;

/// Lock families analyzed independently of each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockFlavor {
    Mutex,
    RwLock,
    LockApi,
}

impl LockFlavor {
    pub const ALL: [LockFlavor; 3] = [LockFlavor::Mutex, LockFlavor::RwLock, LockFlavor::LockApi];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Exclusive,
    Shared,
}

/// Where the lock object and the guard appear at the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgLayout {
    /// `guard = lock(target, ..)`
    Receiver,
    /// `lock(guard_slot, target, ..)` when the callee returns void,
    /// `guard = lock(target, ..)` otherwise.
    OutParam,
    /// Target as in `OutParam`, but the guard is always the call.
    OutParamTarget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockApiKind {
    StdMutexLock,
    StdRwLockRead,
    StdRwLockWrite,
    LockApiMutexLock,
    LockApiRwLockRead,
    LockApiRwLockWrite,
}

impl LockApiKind {
    pub fn flavor(self) -> LockFlavor {
        use LockApiKind::*;
        match self {
            StdMutexLock => LockFlavor::Mutex,
            StdRwLockRead | StdRwLockWrite => LockFlavor::RwLock,
            LockApiMutexLock | LockApiRwLockRead | LockApiRwLockWrite => LockFlavor::LockApi,
        }
    }

    pub fn access(self) -> Access {
        use LockApiKind::*;
        match self {
            StdRwLockRead | LockApiRwLockRead => Access::Shared,
            StdMutexLock | StdRwLockWrite | LockApiMutexLock | LockApiRwLockWrite => {
                Access::Exclusive
            }
        }
    }

    pub fn layout(self) -> ArgLayout {
        match self.flavor() {
            LockFlavor::Mutex => ArgLayout::OutParam,
            LockFlavor::RwLock => ArgLayout::OutParamTarget,
            LockFlavor::LockApi => ArgLayout::Receiver,
        }
    }

    /// Whether acquiring `other` while `self` is held cannot block.
    /// The lock_api read lock is non-recursive: a writer queued between two
    /// reads of one thread blocks the second read. So only std reads nest.
    pub fn nests_with(self, other: LockApiKind) -> bool {
        self == LockApiKind::StdRwLockRead && other == LockApiKind::StdRwLockRead
    }

    pub fn from_symbol(name: &str) -> Option<Self> {
        LOCK_API_REGEX
            .iter()
            .find(|(_, regex)| regex.is_match(name))
            .map(|(kind, _)| *kind)
    }
}

impl fmt::Display for LockApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use LockApiKind::*;
        let s = match self {
            StdMutexLock => "std::sync::Mutex::lock",
            StdRwLockRead => "std::sync::RwLock::read",
            StdRwLockWrite => "std::sync::RwLock::write",
            LockApiMutexLock => "lock_api::Mutex::lock",
            LockApiRwLockRead => "lock_api::RwLock::read",
            LockApiRwLockWrite => "lock_api::RwLock::write",
        };
        f.write_str(s)
    }
}

static LOCK_API_REGEX: Lazy<Vec<(LockApiKind, Regex)>> = Lazy::new(|| {
    macro_rules! lock_api_regex {
        ($mangled:literal, $demangled:literal) => {
            Regex::new(std::concat!(
                r"^(",
                $mangled,
                r"|<?",
                $demangled,
                r"(::|$))"
            ))
            .unwrap()
        };
    }
    vec![
        (
            LockApiKind::StdMutexLock,
            lock_api_regex!(
                r"_ZN3std4sync5mutex14Mutex\$LT\$T\$GT\$4lock17h",
                r"std::sync::(poison::)?mutex::Mutex<.+>::lock"
            ),
        ),
        (
            LockApiKind::StdRwLockRead,
            lock_api_regex!(
                r"_ZN3std4sync6rwlock15RwLock\$LT\$T\$GT\$4read17h",
                r"std::sync::(poison::)?rwlock::RwLock<.+>::read"
            ),
        ),
        (
            LockApiKind::StdRwLockWrite,
            lock_api_regex!(
                r"_ZN3std4sync6rwlock15RwLock\$LT\$T\$GT\$5write17h",
                r"std::sync::(poison::)?rwlock::RwLock<.+>::write"
            ),
        ),
        (
            LockApiKind::LockApiMutexLock,
            lock_api_regex!(
                r"_ZN8lock_api5mutex18Mutex\$LT\$R\$C\$T\$GT\$4lock17h",
                r"lock_api::mutex::Mutex<.+>::lock"
            ),
        ),
        (
            LockApiKind::LockApiRwLockRead,
            lock_api_regex!(
                r"_ZN8lock_api6rwlock19RwLock\$LT\$R\$C\$T\$GT\$4read17h",
                r"lock_api::rwlock::RwLock<.+>::read"
            ),
        ),
        (
            LockApiKind::LockApiRwLockWrite,
            lock_api_regex!(
                r"_ZN8lock_api6rwlock19RwLock\$LT\$R\$C\$T\$GT\$5write17h",
                r"lock_api::rwlock::RwLock<.+>::write"
            ),
        ),
    ]
});

/// Why a call to a lock API could not be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockSiteError {
    NoArguments,
    /// The callee returns void but there is no room for a guard slot.
    MissingOutParam { args: usize },
}

impl fmt::Display for LockSiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockSiteError::NoArguments => write!(f, "lock call without arguments"),
            LockSiteError::MissingOutParam { args } => write!(
                f,
                "void lock call with {} argument(s), expected a guard slot and a lock",
                args
            ),
        }
    }
}

impl Error for LockSiteError {}

/// A recognized lock acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub lock_inst: InstId,
    /// The lock object being acquired.
    pub lock_target: ValueRef,
    /// Where the guard lives: the call itself or its out-parameter.
    pub result: ValueRef,
    pub kind: LockApiKind,
}

impl LockInfo {
    pub fn parse(module: &Module, inst: InstId, kind: LockApiKind) -> Result<Self, LockSiteError> {
        let args = module.call_args(inst).unwrap_or(&[]);
        if args.is_empty() {
            return Err(LockSiteError::NoArguments);
        }
        let returns_void = module.is_void(module.inst(inst).ty);
        let call = ValueRef::Inst(inst);
        let (lock_target, result) = match kind.layout() {
            ArgLayout::Receiver => (args[0], call),
            _ if !returns_void => (args[0], call),
            _ if args.len() < 2 => {
                return Err(LockSiteError::MissingOutParam { args: args.len() })
            }
            ArgLayout::OutParam => (args[1], args[0]),
            ArgLayout::OutParamTarget => (args[1], call),
        };
        Ok(Self {
            lock_inst: inst,
            lock_target,
            result,
            kind,
        })
    }

    pub fn flavor(&self) -> LockFlavor {
        self.kind.flavor()
    }
}

#[derive(Clone, Debug)]
pub struct UnparsedLockSite {
    pub inst: InstId,
    pub kind: LockApiKind,
    pub error: LockSiteError,
}

/// Lock sites of a module, partitioned by flavor and ordered by instruction.
#[derive(Debug, Default)]
pub struct LockSites {
    pub locks: BTreeMap<LockFlavor, BTreeMap<InstId, LockInfo>>,
    pub unparsed: Vec<UnparsedLockSite>,
}

impl LockSites {
    pub fn of_flavor(&self, flavor: LockFlavor) -> Option<&BTreeMap<InstId, LockInfo>> {
        self.locks.get(&flavor)
    }

    pub fn len(&self) -> usize {
        self.locks.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify every call in the module bodies, keeping the enabled flavors.
pub fn collect_lock_sites(module: &Module, flavors: LockFlavors) -> LockSites {
    let mut sites = LockSites::default();
    for func in module.function_ids() {
        if module.function(func).is_declaration() {
            continue;
        }
        for inst in module.insts_of(func) {
            let kind = match module.called_name(inst).and_then(LockApiKind::from_symbol) {
                Some(kind) => kind,
                None => continue,
            };
            if !flavors.contains(kind.flavor().into()) {
                continue;
            }
            match LockInfo::parse(module, inst, kind) {
                Ok(info) => {
                    debug!("lock site {:?} at {}", kind, module.describe(inst));
                    sites
                        .locks
                        .entry(kind.flavor())
                        .or_default()
                        .insert(inst, info);
                }
                Err(error) => {
                    warn!(
                        "cannot parse {} at {}: {}",
                        kind,
                        module.describe(inst),
                        error
                    );
                    sites.unparsed.push(UnparsedLockSite { inst, kind, error });
                }
            }
        }
    }
    sites
}
