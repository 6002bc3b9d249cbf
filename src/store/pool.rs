//! Bounded session pool in front of any [`ConnectionProvider`].

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::PoolConfig;
use crate::error::{Result, SessionOp, TransactionError};

use super::session::{AccessMode, ConnectionProvider, Session};

struct IdleSession {
    session: Box<dyn Session>,
    since: Instant,
}

struct PoolState {
    // Oldest at the front
    idle: VecDeque<IdleSession>,
    outstanding: usize,
    closed: bool,
}

struct PoolShared {
    inner: Arc<dyn ConnectionProvider>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolShared {
    fn give_back(&self, session: Box<dyn Session>) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if state.closed {
            drop(state);
            if let Err(e) = session.close() {
                warn!("Closing session returned after shutdown failed: {}", e);
            }
            return;
        }
        state.idle.push_back(IdleSession {
            session,
            since: Instant::now(),
        });
        self.available.notify_one();
    }

    fn forget_one(&self) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        self.available.notify_one();
    }
}

/// Caps outstanding sessions at `max_pool_size` and reuses released ones.
///
/// `acquire` blocks while the pool is exhausted, for at most the configured
/// connection timeout. Sessions idle longer than the idle timeout are closed,
/// keeping at least `min_idle` around.
#[derive(Clone)]
pub struct PooledProvider {
    shared: Arc<PoolShared>,
}

impl PooledProvider {
    /// Creates the pool and opens `min_idle` sessions up front.
    pub fn new(inner: Arc<dyn ConnectionProvider>, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let mut idle = VecDeque::with_capacity(config.max_pool_size);
        for _ in 0..config.min_idle {
            idle.push_back(IdleSession {
                session: inner.acquire()?,
                since: Instant::now(),
            });
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                inner,
                config,
                state: Mutex::new(PoolState {
                    idle,
                    outstanding: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Number of sessions currently handed out.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    fn evict_expired(&self) {
        let config = &self.shared.config;
        let mut expired = Vec::new();
        {
            let mut state = self.shared.state.lock();
            while state.idle.len() > config.min_idle {
                match state.idle.front() {
                    Some(entry) if entry.since.elapsed() >= config.idle_timeout() => {
                        if let Some(entry) = state.idle.pop_front() {
                            expired.push(entry.session);
                        }
                    }
                    _ => break,
                }
            }
        }

        for session in expired {
            if let Err(e) = session.close() {
                warn!("Closing idle session failed: {}", e);
            }
        }
    }

    fn wrap(&self, session: Box<dyn Session>) -> Box<dyn Session> {
        Box::new(PooledSession {
            session: Some(session),
            shared: Arc::clone(&self.shared),
        })
    }
}

impl ConnectionProvider for PooledProvider {
    fn acquire(&self) -> Result<Box<dyn Session>> {
        self.evict_expired();

        let timeout = self.shared.config.connection_timeout();
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(TransactionError::resource(
                    SessionOp::Acquire,
                    "pool has been shut down",
                ));
            }

            if let Some(entry) = state.idle.pop_back() {
                state.outstanding += 1;
                return Ok(self.wrap(entry.session));
            }

            if state.outstanding < self.shared.config.max_pool_size {
                state.outstanding += 1;
                drop(state);
                return match self.shared.inner.acquire() {
                    Ok(session) => Ok(self.wrap(session)),
                    Err(e) => {
                        self.shared.forget_one();
                        Err(e)
                    }
                };
            }

            if self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(TransactionError::resource(
                    SessionOp::Acquire,
                    format!("timed out after {:?} waiting for a pooled session", timeout),
                ));
            }
        }
    }

    fn shutdown(&self) {
        let idle: Vec<IdleSession> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.shared.available.notify_all();
            state.idle.drain(..).collect()
        };

        debug!("Shutting down pool, closing {} idle sessions", idle.len());
        for entry in idle {
            if let Err(e) = entry.session.close() {
                warn!("Closing idle session during shutdown failed: {}", e);
            }
        }
        self.shared.inner.shutdown();
    }
}

/// A session on loan from a [`PooledProvider`]. Closing it returns the
/// underlying session to the pool.
struct PooledSession {
    session: Option<Box<dyn Session>>,
    shared: Arc<PoolShared>,
}

impl PooledSession {
    fn inner(&self) -> &dyn Session {
        self.session.as_deref().expect("pooled session used after close")
    }

    fn inner_mut(&mut self) -> &mut dyn Session {
        self.session
            .as_deref_mut()
            .expect("pooled session used after close")
    }
}

impl Session for PooledSession {
    fn begin(&mut self, mode: AccessMode) -> Result<()> {
        self.inner_mut().begin(mode)
    }

    fn commit(&mut self) -> Result<()> {
        self.inner_mut().commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner_mut().rollback()
    }

    fn is_active(&self) -> bool {
        self.inner().is_active()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        // Never hand a session with an open transaction to the next borrower
        if session.is_active() {
            if let Err(e) = session.rollback() {
                self.shared.forget_one();
                if let Err(close) = session.close() {
                    warn!("Closing session that failed to roll back also failed: {}", close);
                }
                return Err(TransactionError::resource(
                    SessionOp::Release,
                    format!("discarding session that failed to roll back: {}", e),
                ));
            }
        }

        self.shared.give_back(session);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self.inner_mut().as_any_mut()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        // Dropped without close: the underlying session goes away with it
        if self.session.take().is_some() {
            self.shared.forget_one();
        }
    }
}
