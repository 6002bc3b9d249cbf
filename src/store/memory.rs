//! In-memory transactional key-value store.
//!
//! Writes are buffered per session and applied atomically on commit; rollback
//! discards them. Read-only sessions reject writes. Every lifecycle call is
//! counted so callers can observe what the transaction layer did.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::config::{ConnectionSettings, ISOLATION, SHOW_SQL};
use crate::error::{Result, SessionOp, TransactionError};

use super::session::{AccessMode, ConnectionProvider, Connector, Session};

/// Snapshot of a store's lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub acquires: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub closes: u64,
}

#[derive(Default)]
struct Counters {
    acquires: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    closes: AtomicU64,
}

#[derive(Default)]
struct MemoryInner {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    counters: Counters,
    log_statements: bool,
}

/// A transactional in-memory store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that logs every buffered write at `info` level.
    pub fn with_statement_logging() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                log_statements: true,
                ..MemoryInner::default()
            }),
        }
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.inner.counters;
        StoreStats {
            acquires: c.acquires.load(Ordering::SeqCst),
            begins: c.begins.load(Ordering::SeqCst),
            commits: c.commits.load(Ordering::SeqCst),
            rollbacks: c.rollbacks.load(Ordering::SeqCst),
            closes: c.closes.load(Ordering::SeqCst),
        }
    }

    /// Reads a committed value.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out all committed data.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.inner.data.read().clone()
    }
}

impl ConnectionProvider for MemoryStore {
    fn acquire(&self) -> Result<Box<dyn Session>> {
        self.inner.counters.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            pending: None,
        }))
    }
}

struct Pending {
    mode: AccessMode,
    // None marks a buffered delete
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

/// A session on a [`MemoryStore`].
pub struct MemorySession {
    inner: Arc<MemoryInner>,
    pending: Option<Pending>,
}

impl MemorySession {
    /// Reads a key, seeing this session's own uncommitted writes.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(write) = self.pending.as_ref().and_then(|p| p.writes.get(key)) {
            return write.clone();
        }
        self.inner.data.read().get(key).cloned()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        let log_statements = self.inner.log_statements;
        let writes = self.writable()?;
        if log_statements {
            info!("PUT {}", key);
        }
        writes.insert(key, Some(value.into()));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let log_statements = self.inner.log_statements;
        let writes = self.writable()?;
        if log_statements {
            info!("DELETE {}", key);
        }
        writes.insert(key.to_string(), None);
        Ok(())
    }

    /// Returns all visible entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let mut visible: BTreeMap<String, Vec<u8>> = self
            .inner
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(pending) = &self.pending {
            for (key, write) in pending.writes.iter().filter(|(k, _)| k.starts_with(prefix)) {
                match write {
                    Some(value) => visible.insert(key.clone(), value.clone()),
                    None => visible.remove(key),
                };
            }
        }
        visible.into_iter().collect()
    }

    fn writable(&mut self) -> Result<&mut BTreeMap<String, Option<Vec<u8>>>> {
        match &mut self.pending {
            None => Err(TransactionError::state("No native transaction is open")),
            Some(p) if p.mode == AccessMode::ReadOnly => Err(TransactionError::state(
                "Write attempted in a read-only transaction",
            )),
            Some(p) => Ok(&mut p.writes),
        }
    }
}

impl Session for MemorySession {
    fn begin(&mut self, mode: AccessMode) -> Result<()> {
        if self.pending.is_some() {
            return Err(TransactionError::resource(
                SessionOp::Begin,
                "session already has an open transaction",
            ));
        }
        self.inner.counters.begins.fetch_add(1, Ordering::SeqCst);
        self.pending = Some(Pending {
            mode,
            writes: BTreeMap::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let pending = self.pending.take().ok_or_else(|| {
            TransactionError::resource(SessionOp::Commit, "no open transaction")
        })?;

        if !pending.writes.is_empty() {
            let mut data = self.inner.data.write();
            for (key, write) in pending.writes {
                match write {
                    Some(value) => data.insert(key, value),
                    None => data.remove(&key),
                };
            }
        }
        self.inner.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.pending.take().ok_or_else(|| {
            TransactionError::resource(SessionOp::Rollback, "no open transaction")
        })?;
        self.inner.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.pending.is_some()
    }

    fn close(self: Box<Self>) -> Result<()> {
        if let Some(pending) = &self.pending {
            debug!(
                "Closing memory session with {} uncommitted writes",
                pending.writes.len()
            );
        }
        self.inner.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Connects `memory://<name>` urls to in-process stores. Connecting to the same
/// url twice yields the same store.
///
/// The requested isolation level is accepted but not enforced: each commit
/// applies its buffered writes under one write lock, last writer wins.
#[derive(Default)]
pub struct MemoryConnector {
    stores: Mutex<HashMap<String, MemoryStore>>,
}

impl MemoryConnector {
    pub const SCHEME: &'static str = "memory://";

    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store behind `url` if it has been connected.
    pub fn store(&self, url: &str) -> Option<MemoryStore> {
        self.stores.lock().get(url).cloned()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn ConnectionProvider>> {
        let url = settings.url();
        if !url.starts_with(Self::SCHEME) || url.len() == Self::SCHEME.len() {
            return Err(TransactionError::configuration(format!(
                "unsupported url {:?}, expected {}<name>",
                url,
                Self::SCHEME
            )));
        }

        let log_statements = settings.property(SHOW_SQL) == Some("true");
        let store = self
            .stores
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| {
                if log_statements {
                    MemoryStore::with_statement_logging()
                } else {
                    MemoryStore::new()
                }
            })
            .clone();
        debug!(
            "Connected {} as {} (isolation {} requested, not enforced)",
            url,
            settings.username(),
            settings.property(ISOLATION).unwrap_or("unset")
        );
        Ok(Arc::new(store))
    }
}
