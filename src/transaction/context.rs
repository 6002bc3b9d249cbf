//! Per-execution-unit transaction state.

use log::warn;

use crate::error::{Result, TransactionError};
use crate::selector::Backend;
use crate::store::{AccessMode, Session};

use super::time::TransactionTime;

pub(crate) const NOT_IN_TRANSACTION: &str = "No active transaction";

/// Identifier assigned to each transaction, used for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}

/// Everything that exists only while a transaction is open.
///
/// Dropping it with the session still attached rolls the native transaction
/// back and releases the session, wherever the value ended up.
pub(crate) struct OpenTransaction {
    pub(crate) id: TransactionId,
    pub(crate) backend: Backend,
    pub(crate) mode: AccessMode,
    pub(crate) started_at: TransactionTime,
    session: Option<Box<dyn Session>>,
}

impl OpenTransaction {
    pub(crate) fn new(
        id: TransactionId,
        backend: Backend,
        mode: AccessMode,
        started_at: TransactionTime,
        session: Box<dyn Session>,
    ) -> Self {
        Self {
            id,
            backend,
            mode,
            started_at,
            session: Some(session),
        }
    }

    /// Detaches the session so the caller ends the transaction itself.
    pub(crate) fn take_session(&mut self) -> Option<Box<dyn Session>> {
        self.session.take()
    }
}

impl Drop for OpenTransaction {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        warn!("{} dropped while open, rolling back", self.id);
        if session.is_active() {
            if let Err(e) = session.rollback() {
                warn!("{} rollback failed: {}", self.id, e);
            }
        }
        if let Err(e) = session.close() {
            warn!("{} session release failed: {}", self.id, e);
        }
    }
}

/// Transaction state owned by one execution unit.
///
/// A context is created empty and handed by `&mut` to every manager call.
/// While a transaction is open it holds the session, the transaction id and the
/// fixed transaction time; all three appear and disappear together.
#[derive(Default)]
pub struct TransactionContext {
    open: Option<OpenTransaction>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a transaction is open on this context.
    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    /// Returns the time stamped when the current transaction began.
    pub fn transaction_time(&self) -> Result<TransactionTime> {
        self.open
            .as_ref()
            .map(|txn| txn.started_at)
            .ok_or_else(|| TransactionError::state(NOT_IN_TRANSACTION))
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.open.as_ref().map(|txn| txn.id)
    }

    /// Backend the current transaction runs against.
    pub fn backend(&self) -> Option<Backend> {
        self.open.as_ref().map(|txn| txn.backend)
    }

    pub fn access_mode(&self) -> Option<AccessMode> {
        self.open.as_ref().map(|txn| txn.mode)
    }

    /// Borrows the open session as the backend's concrete session type.
    pub fn session_mut<S: Session>(&mut self) -> Result<&mut S> {
        let (backend, session) = self
            .open
            .as_mut()
            .and_then(|txn| Some((txn.backend, txn.session.as_mut()?)))
            .ok_or_else(|| TransactionError::state("No session has been initialized"))?;
        session.as_any_mut().downcast_mut::<S>().ok_or_else(|| {
            TransactionError::state(format!(
                "{} session is not a {}",
                backend,
                std::any::type_name::<S>()
            ))
        })
    }

    pub(crate) fn open(&mut self, txn: OpenTransaction) {
        self.open = Some(txn);
    }

    pub(crate) fn take(&mut self) -> Option<OpenTransaction> {
        self.open.take()
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.open {
            Some(txn) => f
                .debug_struct("TransactionContext")
                .field("id", &format_args!("{}", txn.id))
                .field("backend", &txn.backend)
                .field("mode", &txn.mode)
                .field("started_at", &txn.started_at)
                .finish(),
            None => f.write_str("TransactionContext(idle)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConnectionProvider, MemorySession, MemoryStore};

    fn open_transaction(store: &MemoryStore) -> OpenTransaction {
        let mut session = store.acquire().unwrap();
        session.begin(AccessMode::ReadWrite).unwrap();
        OpenTransaction::new(
            TransactionId(9),
            Backend::Relational,
            AccessMode::ReadWrite,
            TransactionTime::from_micros(1234),
            session,
        )
    }

    fn expect_err<T>(result: Result<T>) -> TransactionError {
        match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_idle_context() {
        let mut ctx = TransactionContext::new();

        assert!(!ctx.in_transaction());
        assert!(ctx.transaction_id().is_none());
        assert!(ctx.backend().is_none());

        let err = ctx.transaction_time().unwrap_err();
        assert!(err.is_state());
        assert!(err.to_string().contains(NOT_IN_TRANSACTION));

        let err = expect_err(ctx.session_mut::<MemorySession>());
        assert!(err.to_string().contains("No session has been initialized"));
    }

    #[test]
    fn test_open_and_take() {
        let store = MemoryStore::new();
        let mut ctx = TransactionContext::new();
        ctx.open(open_transaction(&store));

        assert!(ctx.in_transaction());
        assert_eq!(ctx.transaction_id(), Some(TransactionId(9)));
        assert_eq!(ctx.backend(), Some(Backend::Relational));
        assert_eq!(ctx.access_mode(), Some(AccessMode::ReadWrite));
        assert_eq!(ctx.transaction_time().unwrap().as_micros(), 1234);
        assert!(ctx.session_mut::<MemorySession>().is_ok());
        assert!(format!("{:?}", ctx).contains("Txn9"));

        let mut txn = ctx.take().unwrap();
        assert!(!ctx.in_transaction());
        let mut session = txn.take_session().unwrap();
        session.rollback().unwrap();
        session.close().unwrap();
        drop(txn);

        // Detached session is not ended a second time
        assert_eq!(store.stats().rollbacks, 1);
        assert_eq!(store.stats().closes, 1);
    }

    #[test]
    fn test_dropped_open_transaction_rolls_back() {
        let store = MemoryStore::new();
        let mut ctx = TransactionContext::new();
        ctx.open(open_transaction(&store));
        ctx.session_mut::<MemorySession>()
            .unwrap()
            .put("orphan", "x")
            .unwrap();

        let mut escaped = TransactionContext::new();
        std::mem::swap(&mut ctx, &mut escaped);
        drop(escaped);

        let stats = store.stats();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.closes, 1);
        assert!(store.get("orphan").is_none());
    }

    #[test]
    fn test_session_downcast_mismatch() {
        struct OtherSession;

        impl Session for OtherSession {
            fn begin(&mut self, _mode: AccessMode) -> Result<()> {
                Ok(())
            }
            fn commit(&mut self) -> Result<()> {
                Ok(())
            }
            fn rollback(&mut self) -> Result<()> {
                Ok(())
            }
            fn is_active(&self) -> bool {
                true
            }
            fn close(self: Box<Self>) -> Result<()> {
                Ok(())
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }

        let mut ctx = TransactionContext::new();
        ctx.open(OpenTransaction::new(
            TransactionId(1),
            Backend::Legacy,
            AccessMode::ReadWrite,
            TransactionTime::from_micros(0),
            Box::new(OtherSession),
        ));

        let err = expect_err(ctx.session_mut::<MemorySession>());
        assert!(err.is_state());
        assert!(ctx.session_mut::<OtherSession>().is_ok());
    }
}
