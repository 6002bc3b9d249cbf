//! storeswitch demo - runs a concurrent workload through the backend selector

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use log::info;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use storeswitch::config::{CredentialLocation, PersistenceConfig};
use storeswitch::credentials::{InMemoryBlobStore, PassthroughDecrypter};
use storeswitch::migration::{run_with_shadow, Verification};
use storeswitch::store::{build_provider, MemoryConnector, MemorySession, MemoryStore, StoreStats};
use storeswitch::{Backend, BackendSelector, TransactionContext, TransactionManager};

/// Runs counter transactions against the current backend, optionally
/// verifying every step against the other one.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Persistence configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend application code is routed to (overrides the config file)
    #[arg(short, long)]
    backend: Option<Backend>,

    /// Number of concurrent workers
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Transactions per worker
    #[arg(short, long, default_value = "25")]
    iterations: u64,

    /// Replay every transaction on the other backend and compare
    #[arg(short, long)]
    shadow: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let mut config = match &args.config {
        Some(path) => PersistenceConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => default_config(),
    };
    if let Some(backend) = args.backend {
        config.current_backend = backend;
    }

    // Local stand-ins for the secret store; the record is kept in plaintext
    let blobs = Arc::new(InMemoryBlobStore::new());
    blobs.put(
        &config.credential.bucket,
        &config.credential.object,
        "local-instance storeswitch demo-password",
    );
    let connector = Arc::new(MemoryConnector::new());
    let legacy_store = MemoryStore::new();

    let selector = {
        let config = config.clone();
        let blobs = Arc::clone(&blobs);
        let connector = Arc::clone(&connector);
        BackendSelector::builder(config.current_backend)
            .provider(Backend::Legacy, Arc::new(legacy_store.clone()))
            .backend(Backend::Relational, move || {
                build_provider(
                    &config,
                    blobs.as_ref(),
                    &PassthroughDecrypter,
                    connector.as_ref(),
                    &BTreeMap::new(),
                )
            })
            .build()
            .context("Failed to configure backends")?
    };

    let current = selector.current()?;
    let counterpart = if args.shadow {
        Some(selector.backend(current.backend().counterpart())?)
    } else {
        None
    };
    println!("Routing work to the {} backend", current.backend());
    if let Some(shadow) = &counterpart {
        println!("Verifying against the {} backend", shadow.backend());
    }

    let iterations = args.iterations;
    let mismatches = thread::scope(|scope| -> Result<u64> {
        let handles: Vec<_> = (0..args.workers)
            .map(|worker| {
                let current = &current;
                let counterpart = counterpart.as_deref();
                scope.spawn(move || run_worker(worker, iterations, current, counterpart))
            })
            .collect();

        let mut mismatches = 0;
        for handle in handles {
            mismatches += handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }
        Ok(mismatches)
    })?;

    println!();
    print_stats("legacy", legacy_store.stats());
    if let Some(store) = connector.store(&config.url) {
        print_stats("relational", store.stats());
    }
    if args.shadow {
        println!("Mismatches: {}", mismatches);
    }

    selector.shutdown();
    Ok(())
}

fn default_config() -> PersistenceConfig {
    PersistenceConfig {
        url: "memory://storeswitch".to_string(),
        credential: CredentialLocation {
            bucket: "local-secrets".to_string(),
            object: "relational-credential".to_string(),
            key_name: "relational-key".to_string(),
        },
        ..PersistenceConfig::default()
    }
}

/// Increments this worker's counter `iterations` times. Returns how many
/// steps disagreed with the shadow backend.
fn run_worker(
    worker: usize,
    iterations: u64,
    current: &TransactionManager,
    shadow: Option<&TransactionManager>,
) -> Result<u64> {
    let key = format!("counter/{}", worker);
    let increment = |ctx: &mut TransactionContext| -> Result<u64> {
        let session = ctx.session_mut::<MemorySession>()?;
        let value = match session.get(&key) {
            Some(raw) => String::from_utf8(raw)?.parse::<u64>()?,
            None => 0,
        };
        session.put(key.clone(), (value + 1).to_string())?;
        Ok(value + 1)
    };

    let mut ctx = TransactionContext::new();
    let mut mismatches = 0;
    for _ in 0..iterations {
        let value = match shadow {
            Some(shadow) => match run_with_shadow(current, shadow, &mut ctx, increment)? {
                Verification::Match(value) => value,
                other => {
                    mismatches += 1;
                    other.into_primary()
                }
            },
            None => current.transact(&mut ctx, increment)?,
        };
        info!("worker {} -> {}", worker, value);
    }
    Ok(mismatches)
}

fn print_stats(name: &str, stats: StoreStats) {
    println!(
        "{:<10} acquires={} begins={} commits={} rollbacks={} closes={}",
        name, stats.acquires, stats.begins, stats.commits, stats.rollbacks, stats.closes
    );
}
