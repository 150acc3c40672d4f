use std::fmt;

use serde::Serialize;

use crate::analysis::ir::{InstId, Module};
use crate::interest::concurrency::lock::LockInfo;

/// Where a lock is acquired, rendered for humans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LockSite {
    pub kind: String,
    pub function: String,
    pub location: String,
}

impl LockSite {
    pub fn new(module: &Module, info: &LockInfo) -> Self {
        Self {
            kind: info.kind.to_string(),
            function: module.function(module.function_of(info.lock_inst)).name.clone(),
            location: module.describe(info.lock_inst),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DoubleLockDiagnosis {
    pub first_lock: LockSite,
    pub second_locks: Vec<LockSite>,
    /// Call sites from the first lock's function down to the function
    /// holding the second lock(s); empty when both are in one function.
    pub callchain: Vec<String>,
}

impl DoubleLockDiagnosis {
    pub fn new(
        module: &Module,
        first: &LockInfo,
        seconds: &[LockInfo],
        callchain: &[InstId],
    ) -> Self {
        Self {
            first_lock: LockSite::new(module, first),
            second_locks: seconds.iter().map(|info| LockSite::new(module, info)).collect(),
            callchain: callchain.iter().map(|site| module.describe(*site)).collect(),
        }
    }
}

impl fmt::Display for DoubleLockDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Double Lock Happens! First Lock:")?;
        writeln!(f, " {}", self.first_lock.location)?;
        writeln!(f, "Second Lock(s):")?;
        for second in &self.second_locks {
            writeln!(f, " {}", second.location)?;
        }
        if !self.callchain.is_empty() {
            writeln!(f, "Callchain:")?;
            for site in &self.callchain {
                writeln!(f, " {}", site)?;
            }
        }
        Ok(())
    }
}
