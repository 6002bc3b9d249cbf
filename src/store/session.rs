//! Session and provider traits every backend implements.

use std::any::Any;
use std::sync::Arc;

use crate::config::ConnectionSettings;
use crate::error::Result;

/// Access mode a native transaction is begun with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadWrite => write!(f, "read-write"),
            Self::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// A low-level backend session able to run one native transaction at a time.
pub trait Session: Send + 'static {
    /// Begins a native transaction in the given mode.
    fn begin(&mut self, mode: AccessMode) -> Result<()>;

    /// Commits the open native transaction.
    fn commit(&mut self) -> Result<()>;

    /// Rolls back the open native transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Returns true while a native transaction is open on this session.
    fn is_active(&self) -> bool;

    /// Hands the session back to whoever issued it. For pooled sessions this
    /// does not close the underlying connection.
    fn close(self: Box<Self>) -> Result<()>;

    /// Gives work access to the concrete session type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Source of sessions for one backend.
pub trait ConnectionProvider: Send + Sync {
    /// Acquires a session, blocking under pool exhaustion.
    fn acquire(&self) -> Result<Box<dyn Session>>;

    /// Releases any pooled resources. Called once at teardown.
    fn shutdown(&self) {}
}

/// Driver seam: builds a provider from fully resolved connection settings.
pub trait Connector: Send + Sync {
    fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn ConnectionProvider>>;
}
