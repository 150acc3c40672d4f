//! Static detection of double locks on a compiled, guard-based locking program.
//!
//! The pipeline is: load a `Module`, index its call graph, classify the lock
//! sites, group them by lock identity, trace where each guard is released,
//! and walk the control flow after every lock looking for a second
//! acquisition of the same lock before the release.
pub mod analysis;
pub mod config;
pub mod detector;
pub mod interest;
pub mod options;
