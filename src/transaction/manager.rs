//! Transaction manager: runs caller work inside a native backend transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Result, TransactionError};
use crate::selector::Backend;
use crate::store::{AccessMode, ConnectionProvider};

use super::context::{OpenTransaction, TransactionContext, TransactionId, NOT_IN_TRANSACTION};
use super::time::{Clock, SystemClock, TransactionTime};

/// Runs work atomically against one backend.
///
/// The manager itself only holds its provider, its clock and an id counter, so
/// one instance can be shared by any number of threads. All per-transaction
/// state lives in the [`TransactionContext`] each caller passes in.
///
/// Work is a closure receiving the context. Its error type is the caller's own:
/// it only needs `From<TransactionError>` so the manager can report state and
/// session failures through the same `Result`. Work errors come back untouched.
pub struct TransactionManager {
    backend: Backend,
    provider: Arc<dyn ConnectionProvider>,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
}

impl TransactionManager {
    /// Creates a manager drawing sessions from `provider`.
    pub fn new(backend: Backend, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            backend,
            provider,
            clock: Arc::new(SystemClock),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replaces the clock used to stamp transaction times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Returns true while `ctx` has an open transaction.
    pub fn in_transaction(&self, ctx: &TransactionContext) -> bool {
        ctx.in_transaction()
    }

    pub fn assert_in_transaction(&self, ctx: &TransactionContext) -> Result<()> {
        if !self.in_transaction(ctx) {
            return Err(TransactionError::state(NOT_IN_TRANSACTION));
        }
        Ok(())
    }

    /// Runs `work` in a new read-write transaction and commits it, or rolls it
    /// back if work fails or panics.
    ///
    /// Fails with a state error before anything else happens if `ctx` already
    /// has a transaction open; nested transactions are never flattened.
    pub fn transact<R, E, F>(&self, ctx: &mut TransactionContext, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut TransactionContext) -> std::result::Result<R, E>,
        E: From<TransactionError>,
    {
        self.run(ctx, AccessMode::ReadWrite, work)
    }

    /// Same as [`transact`](Self::transact). Backends offer no nested
    /// transactions, so "a brand-new transaction" and "the current one" are
    /// the same boundary.
    pub fn transact_new<R, E, F>(
        &self,
        ctx: &mut TransactionContext,
        work: F,
    ) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut TransactionContext) -> std::result::Result<R, E>,
        E: From<TransactionError>,
    {
        self.transact(ctx, work)
    }

    /// Runs `work` in a read-only transaction.
    ///
    /// Sessions begun read-only reject writes. A backend that cannot offer a
    /// read-only mode fails `begin`, which surfaces as a resource error.
    pub fn transact_read_only<R, E, F>(
        &self,
        ctx: &mut TransactionContext,
        work: F,
    ) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut TransactionContext) -> std::result::Result<R, E>,
        E: From<TransactionError>,
    {
        self.run(ctx, AccessMode::ReadOnly, work)
    }

    /// Runs `work` with no transaction open.
    pub fn do_transactionless<R, E, F>(
        &self,
        ctx: &mut TransactionContext,
        work: F,
    ) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut TransactionContext) -> std::result::Result<R, E>,
        E: From<TransactionError>,
    {
        if self.in_transaction(ctx) {
            return Err(TransactionError::state(
                "Transactionless work cannot run inside a transaction",
            )
            .into());
        }
        work(ctx)
    }

    /// Returns the time fixed when the current transaction began.
    pub fn transaction_time(&self, ctx: &TransactionContext) -> Result<TransactionTime> {
        self.assert_in_transaction(ctx)?;
        ctx.transaction_time()
    }

    fn run<R, E, F>(
        &self,
        ctx: &mut TransactionContext,
        mode: AccessMode,
        work: F,
    ) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut TransactionContext) -> std::result::Result<R, E>,
        E: From<TransactionError>,
    {
        if ctx.in_transaction() {
            return Err(TransactionError::state(
                "Error starting the transaction as the previous one is still active",
            )
            .into());
        }

        let mut session = self.provider.acquire()?;
        if let Err(e) = session.begin(mode) {
            if let Err(release) = session.close() {
                warn!(
                    "Releasing {} session after failed begin also failed: {}",
                    self.backend, release
                );
            }
            return Err(e.into());
        }

        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let started_at = self.clock.now();
        ctx.open(OpenTransaction::new(id, self.backend, mode, started_at, session));
        debug!("{} began on {} ({}) at {}", id, self.backend, mode, started_at);

        let guard = TransactionGuard { ctx };
        let outcome = work(&mut *guard.ctx);
        guard.finish(outcome)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("backend", &self.backend)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Ends the transaction opened on `ctx`. Dropping the guard without calling
/// [`finish`](Self::finish), which only happens while unwinding out of work,
/// rolls back and releases the session.
struct TransactionGuard<'a> {
    ctx: &'a mut TransactionContext,
}

impl TransactionGuard<'_> {
    fn finish<R, E>(self, outcome: std::result::Result<R, E>) -> std::result::Result<R, E>
    where
        E: From<TransactionError>,
    {
        // Work that moved the transaction out of the context also moved its
        // cleanup: the open transaction rolls back wherever it is dropped.
        let cleared = || TransactionError::state("Transaction context was cleared by work");
        let Some(mut txn) = self.ctx.take() else {
            return outcome.and_then(|_| Err(cleared().into()));
        };
        let Some(mut session) = txn.take_session() else {
            return outcome.and_then(|_| Err(cleared().into()));
        };
        let id = txn.id;

        let mut outcome = match outcome {
            Ok(result) => match session.commit() {
                Ok(()) => {
                    debug!("{} committed", id);
                    Ok(result)
                }
                Err(e) => {
                    if session.is_active() {
                        if let Err(rollback) = session.rollback() {
                            warn!("{} rollback after failed commit failed: {}", id, rollback);
                        }
                    }
                    Err(E::from(e))
                }
            },
            Err(work_error) => {
                // Work may already have ended the native transaction itself
                if session.is_active() {
                    match session.rollback() {
                        Ok(()) => debug!("{} rolled back", id),
                        Err(rollback) => {
                            warn!("{} rollback after failed work failed: {}", id, rollback)
                        }
                    }
                }
                Err(work_error)
            }
        };

        if let Err(release) = session.close() {
            if outcome.is_ok() {
                outcome = Err(E::from(release));
            } else {
                warn!("{} session release failed: {}", id, release);
            }
        }
        outcome
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        // Still open only when work unwound past finish
        if let Some(txn) = self.ctx.take() {
            warn!("{} abandoned by panicking work", txn.id);
        }
    }
}
