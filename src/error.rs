//! Error types shared by the transaction layer and its collaborators.

use thiserror::Error;

/// The session operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    Acquire,
    Begin,
    Commit,
    Rollback,
    Release,
}

impl std::fmt::Display for SessionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquire => write!(f, "acquire"),
            Self::Begin => write!(f, "begin"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// Errors raised by the transaction layer itself.
///
/// Failures produced by caller-supplied work never pass through this type:
/// work returns its own error type, which only needs `From<TransactionError>`
/// so the manager can report its own failures in the same channel.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Illegal use of the transaction contract.
    #[error("Illegal transaction state: {0}")]
    State(String),

    /// A session could not be acquired, begun, committed, rolled back or released.
    #[error("Session {op} failed: {message}")]
    Resource { op: SessionOp, message: String },

    /// Missing or malformed backend configuration or credentials.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransactionError {
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub fn resource(op: SessionOp, message: impl Into<String>) -> Self {
        Self::Resource {
            op,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Resource { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result type for transaction-layer operations.
pub type Result<T> = std::result::Result<T, TransactionError>;
