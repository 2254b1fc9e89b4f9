//! PostgreSQL persistence for records and the sync log.

mod logs;
mod pool;
mod records;

pub use logs::*;
pub use pool::*;
pub use records::*;
