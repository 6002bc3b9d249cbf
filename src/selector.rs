//! Backend selection.
//!
//! A [`BackendSelector`] is built once at the composition root and passed to
//! whatever needs a transaction manager. It constructs each backend's manager
//! lazily, at most once, and designates one backend as current. Application
//! code asks for [`BackendSelector::current`]; migration tooling that must
//! address a specific backend uses [`BackendSelector::backend`].

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransactionError};
use crate::store::ConnectionProvider;
use crate::transaction::{Clock, TransactionManager};

/// Storage technologies that can sit behind the transaction contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// The store being migrated away from.
    Legacy,
    /// The relational store being migrated to.
    Relational,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Legacy, Backend::Relational];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Relational => "relational",
        }
    }

    /// The other backend of the migration pair.
    pub fn counterpart(&self) -> Backend {
        match self {
            Self::Legacy => Self::Relational,
            Self::Relational => Self::Legacy,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "relational" => Ok(Self::Relational),
            other => Err(TransactionError::configuration(format!(
                "unknown backend {:?}",
                other
            ))),
        }
    }
}

type ProviderFactory = Box<dyn Fn() -> Result<Arc<dyn ConnectionProvider>> + Send + Sync>;

/// Builder for [`BackendSelector`].
pub struct SelectorBuilder {
    current: Backend,
    factories: HashMap<Backend, ProviderFactory>,
    clock: Option<Arc<dyn Clock>>,
}

impl SelectorBuilder {
    /// Registers a factory run the first time `backend` is requested.
    ///
    /// The factory runs while the selector holds that backend's slot, so it
    /// must not call back into the same selector.
    pub fn backend<F>(mut self, backend: Backend, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ConnectionProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(backend, Box::new(factory));
        self
    }

    /// Registers an already constructed provider.
    pub fn provider(self, backend: Backend, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.backend(backend, move || Ok(Arc::clone(&provider)))
    }

    /// Clock handed to every manager the selector builds.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<BackendSelector> {
        if !self.factories.contains_key(&self.current) {
            return Err(TransactionError::configuration(format!(
                "current backend {} has no registered provider",
                self.current
            )));
        }
        Ok(BackendSelector {
            current: self.current,
            factories: self.factories,
            clock: self.clock,
            managers: DashMap::new(),
            shut_down: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Lazily built transaction managers, one per backend, with one current.
pub struct BackendSelector {
    current: Backend,
    factories: HashMap<Backend, ProviderFactory>,
    clock: Option<Arc<dyn Clock>>,
    managers: DashMap<Backend, Arc<TransactionManager>>,
    shut_down: Arc<AtomicBool>,
}

impl BackendSelector {
    /// Starts a selector whose current backend is `current`. The designation
    /// is fixed for the selector's lifetime.
    pub fn builder(current: Backend) -> SelectorBuilder {
        SelectorBuilder {
            current,
            factories: HashMap::new(),
            clock: None,
        }
    }

    pub fn current_backend(&self) -> Backend {
        self.current
    }

    /// The manager application code should use.
    pub fn current(&self) -> Result<Arc<TransactionManager>> {
        self.backend(self.current)
    }

    pub fn legacy(&self) -> Result<Arc<TransactionManager>> {
        self.backend(Backend::Legacy)
    }

    pub fn relational(&self) -> Result<Arc<TransactionManager>> {
        self.backend(Backend::Relational)
    }

    /// Returns the manager for `backend`, constructing it on first use.
    pub fn backend(&self, backend: Backend) -> Result<Arc<TransactionManager>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TransactionError::configuration(
                "backend selector has been shut down",
            ));
        }
        if let Some(manager) = self.managers.get(&backend) {
            return Ok(Arc::clone(manager.value()));
        }

        let factory = self.factories.get(&backend).ok_or_else(|| {
            TransactionError::configuration(format!(
                "no provider registered for backend {}",
                backend
            ))
        })?;

        let manager = self
            .managers
            .entry(backend)
            .or_try_insert_with(|| {
                info!("Initializing {} transaction manager", backend);
                let mut manager = TransactionManager::new(backend, factory()?);
                if let Some(clock) = &self.clock {
                    manager = manager.with_clock(Arc::clone(clock));
                }
                Ok::<_, TransactionError>(Arc::new(manager))
            })
            .map(|entry| Arc::clone(entry.value()))?;

        // A shutdown that swept the map before this insert never saw it
        if self.shut_down.load(Ordering::SeqCst) {
            self.shut_down_backend(backend);
            return Err(TransactionError::configuration(
                "backend selector has been shut down",
            ));
        }
        Ok(manager)
    }

    pub fn is_initialized(&self, backend: Backend) -> bool {
        self.managers.contains_key(&backend)
    }

    /// Shuts down every provider constructed so far. Further lookups fail.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for backend in Backend::ALL {
            self.shut_down_backend(backend);
        }
    }

    // Removal makes whichever caller gets the manager the only one to shut it down
    fn shut_down_backend(&self, backend: Backend) {
        if let Some((_, manager)) = self.managers.remove(&backend) {
            debug!("Shutting down {} provider", backend);
            manager.provider().shutdown();
        }
    }
}

impl Drop for BackendSelector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
