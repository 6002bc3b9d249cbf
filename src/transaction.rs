//! Transaction management.
//!
//! This module provides the transaction boundary application code runs work in:
//! - Per-execution-unit transaction state (`TransactionContext`)
//! - The begin / work / commit-or-rollback algorithm (`TransactionManager`)
//! - The fixed transaction time and the clocks that stamp it

pub mod context;
pub mod manager;
pub mod time;

// Re-export commonly used types
pub use context::{TransactionContext, TransactionId};
pub use manager::TransactionManager;
pub use time::{Clock, FixedClock, SystemClock, TransactionTime};
