//! Reports for different kinds of bugs.
//! ReportContent includes bug kind, possibility, diagnosis, and explanation.
//! The diagnosis for different kinds of bugs may be different.
//! e.g., doublelock diagnosis contains the first lock, the second lock(s)
//! and the callchain leading to them,
//! while an unparsed lock site is diagnosed by a plain message.
use std::fmt;

use serde::Serialize;

use crate::detector::drop::ManualDropDiagnosis;
use crate::detector::lock::report::DoubleLockDiagnosis;

#[derive(Debug, Serialize)]
pub struct ReportContent<D> {
    pub bug_kind: String,
    pub possibility: String,
    pub diagnosis: D,
    pub explanation: String,
}

impl<D: std::fmt::Debug> ReportContent<D> {
    pub fn new(bug_kind: String, possibility: String, diagnosis: D, explanation: String) -> Self {
        Self {
            bug_kind,
            possibility,
            diagnosis,
            explanation,
        }
    }
}

#[derive(Debug, Serialize)]
pub enum Report {
    DoubleLock(ReportContent<DoubleLockDiagnosis>),
    UnparsedLockSite(ReportContent<String>),
    ManualDrop(ReportContent<ManualDropDiagnosis>),
}

impl Report {
    pub fn bug_kind(&self) -> &str {
        match self {
            Report::DoubleLock(content) => &content.bug_kind,
            Report::UnparsedLockSite(content) => &content.bug_kind,
            Report::ManualDrop(content) => &content.bug_kind,
        }
    }
}

/// The plain-text rendering printed by default.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::DoubleLock(content) => write!(f, "{}", content.diagnosis),
            Report::UnparsedLockSite(content) => {
                writeln!(f, "Unparsed Lock Site: {}", content.diagnosis)
            }
            Report::ManualDrop(content) => write!(f, "{}", content.diagnosis),
        }
    }
}
