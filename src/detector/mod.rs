pub mod drop;
pub mod lock;
pub mod report;
