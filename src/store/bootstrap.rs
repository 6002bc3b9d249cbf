//! Builds a pooled provider from configuration and stored credentials.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::config::{ConnectionSettings, PersistenceConfig};
use crate::credentials::{load_credentials, BlobStore, KeyDecrypter};
use crate::error::Result;

use super::pool::PooledProvider;
use super::session::{ConnectionProvider, Connector};

/// Loads credentials, resolves connection settings and connects through
/// `connector`, wrapping the result in a [`PooledProvider`].
///
/// Invalid configuration and malformed credential records fail before the
/// connector is touched.
pub fn build_provider(
    config: &PersistenceConfig,
    blobs: &dyn BlobStore,
    decrypter: &dyn KeyDecrypter,
    connector: &dyn Connector,
    overrides: &BTreeMap<String, String>,
) -> Result<Arc<dyn ConnectionProvider>> {
    config.validate()?;
    let credentials = load_credentials(&config.credential, blobs, decrypter)?;
    let settings = ConnectionSettings::resolve(config, &credentials, overrides)?;
    let pool = settings.pool()?;

    let provider = connector.connect(&settings)?;
    info!(
        "Connected to {} via {} (pool {}..{}, isolation {})",
        settings.url(),
        settings.endpoint(),
        pool.min_idle,
        pool.max_pool_size,
        config.isolation.as_str()
    );
    Ok(Arc::new(PooledProvider::new(provider, pool)?))
}
