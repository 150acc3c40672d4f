//! Detector policy: which lock flavors to analyze and which functions to skip.
use bitflags::bitflags;

use crate::interest::concurrency::lock::LockFlavor;

bitflags! {
    pub struct LockFlavors: u8 {
        const MUTEX = 0b001;
        const RWLOCK = 0b010;
        const LOCKAPI = 0b100;
    }
}

impl From<LockFlavor> for LockFlavors {
    fn from(flavor: LockFlavor) -> Self {
        match flavor {
            LockFlavor::Mutex => LockFlavors::MUTEX,
            LockFlavor::RwLock => LockFlavors::RWLOCK,
            LockFlavor::LockApi => LockFlavors::LOCKAPI,
        }
    }
}

impl LockFlavors {
    pub fn parse(s: &str) -> Result<Self, &'static str> {
        let mut flavors = LockFlavors::empty();
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            flavors |= match name {
                "mutex" => LockFlavors::MUTEX,
                "rwlock" => LockFlavors::RWLOCK,
                "lockapi" => LockFlavors::LOCKAPI,
                _ => return Err("UnsupportedLockFlavor"),
            };
        }
        Ok(flavors)
    }
}

/// Symbol prefixes of functions whose lock sites are never reported.
/// `LightSync::maintain_sync` of ethcore is known to blow up the search.
pub const DEFAULT_SUPPRESSED: &[&str] = &[
    "_ZN12ethcore_sync10light_sync18LightSync$LT$L$GT$13maintain_sync17h",
    "ethcore_sync::light_sync::LightSync<L>::maintain_sync",
];

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub flavors: LockFlavors,
    pub suppressed: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            flavors: LockFlavors::all(),
            suppressed: DEFAULT_SUPPRESSED.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

impl DetectorConfig {
    pub fn is_enabled(&self, flavor: LockFlavor) -> bool {
        self.flavors.contains(flavor.into())
    }

    pub fn is_suppressed(&self, function_name: &str) -> bool {
        self.suppressed
            .iter()
            .any(|prefix| function_name.starts_with(prefix.as_str()))
    }
}
