pub mod config;
pub mod credentials;
pub mod error;
pub mod migration;
pub mod selector;
pub mod store;
pub mod transaction;

pub use error::{Result, SessionOp, TransactionError};
pub use selector::{Backend, BackendSelector};
pub use transaction::{TransactionContext, TransactionManager, TransactionTime};
