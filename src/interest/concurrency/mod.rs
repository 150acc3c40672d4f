pub mod lock;
pub mod release;
pub mod source;
