//! Persistence configuration and connection-settings resolution.
//!
//! Configuration is consumed only when a provider is built. Settings resolve in
//! layers: defaults derived from [`PersistenceConfig`], then caller overrides,
//! then the connection target and credentials, with later layers winning.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::error::{Result, TransactionError};
use crate::selector::Backend;

pub const URL: &str = "connection.url";
pub const USER: &str = "connection.user";
pub const ENDPOINT: &str = "connection.endpoint";
pub const ISOLATION: &str = "connection.isolation";
pub const SHOW_SQL: &str = "connection.show_sql";
pub const POOL_MINIMUM_IDLE: &str = "pool.minimum_idle";
pub const POOL_MAXIMUM_SIZE: &str = "pool.maximum_size";
pub const POOL_IDLE_TIMEOUT_MS: &str = "pool.idle_timeout_ms";
pub const POOL_CONNECTION_TIMEOUT_MS: &str = "pool.connection_timeout_ms";

/// Transaction isolation level requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read_uncommitted",
            Self::ReadCommitted => "read_committed",
            Self::RepeatableRead => "repeatable_read",
            Self::Serializable => "serializable",
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_pool_size: usize,
    pub idle_timeout_ms: u64,
    pub connection_timeout_ms: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(TransactionError::configuration(
                "max_pool_size must be greater than zero",
            ));
        }
        if self.min_idle > self.max_pool_size {
            return Err(TransactionError::configuration(format!(
                "min_idle ({}) exceeds max_pool_size ({})",
                self.min_idle, self.max_pool_size
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_pool_size: 20,
            idle_timeout_ms: 300_000,
            connection_timeout_ms: 20_000,
        }
    }
}

/// Where the encrypted credential record lives and which key decrypts it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialLocation {
    pub bucket: String,
    pub object: String,
    pub key_name: String,
}

/// Top-level persistence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Connection string of the relational backend.
    pub url: String,
    /// Backend application code is routed to by default.
    pub current_backend: Backend,
    pub isolation: IsolationLevel,
    pub log_sql_queries: bool,
    pub pool: PoolConfig,
    pub credential: CredentialLocation,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            current_backend: Backend::Legacy,
            isolation: IsolationLevel::default(),
            log_sql_queries: false,
            pool: PoolConfig::default(),
            credential: CredentialLocation::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            TransactionError::configuration(format!("invalid persistence config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            TransactionError::configuration(format!("cannot read {:?}: {}", path, e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(TransactionError::configuration("connection url is empty"));
        }
        self.pool.validate()
    }

    /// Default connection properties derived from this configuration.
    pub fn default_properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        properties.insert(ISOLATION.to_string(), self.isolation.as_str().to_string());
        properties.insert(SHOW_SQL.to_string(), self.log_sql_queries.to_string());
        properties.insert(POOL_MINIMUM_IDLE.to_string(), self.pool.min_idle.to_string());
        properties.insert(
            POOL_MAXIMUM_SIZE.to_string(),
            self.pool.max_pool_size.to_string(),
        );
        properties.insert(
            POOL_IDLE_TIMEOUT_MS.to_string(),
            self.pool.idle_timeout_ms.to_string(),
        );
        properties.insert(
            POOL_CONNECTION_TIMEOUT_MS.to_string(),
            self.pool.connection_timeout_ms.to_string(),
        );
        properties
    }
}

/// Fully resolved settings handed to a [`crate::store::Connector`].
#[derive(Clone)]
pub struct ConnectionSettings {
    properties: BTreeMap<String, String>,
    password: String,
}

impl ConnectionSettings {
    pub fn resolve(
        config: &PersistenceConfig,
        credentials: &Credentials,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut properties = config.default_properties();
        properties.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        properties.insert(URL.to_string(), config.url.clone());
        properties.insert(USER.to_string(), credentials.username().to_string());
        properties.insert(ENDPOINT.to_string(), credentials.endpoint().to_string());

        let settings = Self {
            properties,
            password: credentials.password().to_string(),
        };
        settings.pool()?.validate()?;
        Ok(settings)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn url(&self) -> &str {
        self.property(URL).unwrap_or_default()
    }

    pub fn username(&self) -> &str {
        self.property(USER).unwrap_or_default()
    }

    pub fn endpoint(&self) -> &str {
        self.property(ENDPOINT).unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Pool sizing after overrides have been applied.
    pub fn pool(&self) -> Result<PoolConfig> {
        Ok(PoolConfig {
            min_idle: self.parse(POOL_MINIMUM_IDLE)?,
            max_pool_size: self.parse(POOL_MAXIMUM_SIZE)?,
            idle_timeout_ms: self.parse(POOL_IDLE_TIMEOUT_MS)?,
            connection_timeout_ms: self.parse(POOL_CONNECTION_TIMEOUT_MS)?,
        })
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        let raw = self
            .property(key)
            .ok_or_else(|| TransactionError::configuration(format!("missing property {}", key)))?;
        raw.parse().map_err(|_| {
            TransactionError::configuration(format!("invalid value {:?} for {}", raw, key))
        })
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("properties", &self.properties)
            .field("password", &"<redacted>")
            .finish()
    }
}
