//! Backend plumbing behind the transaction manager.
//!
//! Every storage technology plugs in through the same two traits:
//!
//! - **ConnectionProvider**: hands out sessions, possibly blocking under pool exhaustion
//! - **Session**: one native transaction at a time (begin, commit, rollback, close)
//!
//! On top of those sit a generic connection pool, an in-memory transactional
//! store, and the bootstrap path that turns configuration and credentials into
//! a ready provider.

pub mod bootstrap;
pub mod memory;
pub mod pool;
pub mod session;

pub use bootstrap::build_provider;
pub use memory::{MemoryConnector, MemorySession, MemoryStore, StoreStats};
pub use pool::PooledProvider;
pub use session::{AccessMode, ConnectionProvider, Connector, Session};
