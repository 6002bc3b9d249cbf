use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use storeswitch::config::{CredentialLocation, PersistenceConfig, POOL_MAXIMUM_SIZE};
use storeswitch::credentials::{InMemoryBlobStore, PassthroughDecrypter};
use storeswitch::migration::{run_with_shadow, Verification};
use storeswitch::store::{build_provider, MemoryConnector, MemorySession, MemoryStore};
use storeswitch::{
    Backend, BackendSelector, TransactionContext, TransactionError, TransactionManager,
};

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

fn register(ctx: &mut TransactionContext, domain: &str) -> Result<(), AppError> {
    if !domain.contains('.') {
        return Err(AppError::InvalidDomain(domain.to_string()));
    }
    let stamp = ctx.transaction_time()?;
    let session = ctx.session_mut::<MemorySession>()?;
    session.put(format!("domain/{}", domain), stamp.to_string())?;
    Ok(())
}

fn legacy_manager() -> (TransactionManager, MemoryStore) {
    let store = MemoryStore::new();
    (
        TransactionManager::new(Backend::Legacy, Arc::new(store.clone())),
        store,
    )
}

#[test]
fn test_committed_work_is_visible() {
    let (tm, store) = legacy_manager();
    let mut ctx = TransactionContext::new();

    tm.transact(&mut ctx, |ctx| register(ctx, "example.tld"))
        .unwrap();

    assert!(store.get("domain/example.tld").is_some());
    assert!(!tm.in_transaction(&ctx));
    let stats = store.stats();
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 0);
    assert_eq!(stats.closes, 1);
}

#[test]
fn test_failed_work_is_rolled_back() {
    let (tm, store) = legacy_manager();
    let mut ctx = TransactionContext::new();

    let result = tm.transact(&mut ctx, |ctx| {
        register(ctx, "first.tld")?;
        register(ctx, "no-dot")
    });

    assert!(matches!(result, Err(AppError::InvalidDomain(d)) if d == "no-dot"));
    assert!(store.is_empty());
    assert!(!tm.in_transaction(&ctx));
    assert_eq!(store.stats().rollbacks, 1);
    assert_eq!(store.stats().closes, 1);
}

#[test]
fn test_time_is_fixed_for_the_whole_transaction() {
    let (tm, _store) = legacy_manager();
    let mut ctx = TransactionContext::new();

    let (first, second) = tm
        .transact(&mut ctx, |ctx| {
            let first = ctx.transaction_time()?;
            thread::sleep(Duration::from_millis(5));
            let second = tm.transaction_time(ctx)?;
            Ok::<_, TransactionError>((first, second))
        })
        .unwrap();
    assert_eq!(first, second);

    let next = tm
        .transact(&mut ctx, |ctx| ctx.transaction_time())
        .unwrap();
    assert!(next > first);
}

#[test]
fn test_nested_transaction_is_rejected() {
    let (tm, store) = legacy_manager();
    let mut ctx = TransactionContext::new();

    let result = tm.transact(&mut ctx, |ctx| {
        register(ctx, "outer.tld")?;
        tm.transact(ctx, |_| Ok::<_, AppError>(()))
    });

    match result {
        Err(AppError::Transaction(e)) => assert!(e.is_state()),
        other => panic!("unexpected result {:?}", other),
    }
    // The outer transaction saw the failure and rolled back
    assert!(store.is_empty());
    assert_eq!(store.stats().begins, 1);
}

#[test]
fn test_transaction_time_requires_transaction() {
    let (tm, _store) = legacy_manager();
    let ctx = TransactionContext::new();

    assert!(tm.transaction_time(&ctx).unwrap_err().is_state());
    assert!(tm.assert_in_transaction(&ctx).unwrap_err().is_state());
}

#[test]
fn test_transactionless_inside_transaction_is_rejected() {
    let (tm, _store) = legacy_manager();
    let mut ctx = TransactionContext::new();

    let outside = tm
        .do_transactionless(&mut ctx, |ctx| Ok::<_, TransactionError>(ctx.in_transaction()))
        .unwrap();
    assert!(!outside);

    let inside = tm.transact(&mut ctx, |ctx| {
        tm.do_transactionless(ctx, |_| Ok::<_, TransactionError>(()))
    });
    assert!(inside.unwrap_err().is_state());
}

#[test]
fn test_read_only_rejects_writes() {
    let (tm, store) = legacy_manager();
    let mut ctx = TransactionContext::new();
    tm.transact(&mut ctx, |ctx| register(ctx, "seed.tld")).unwrap();

    let seen = tm
        .transact_read_only(&mut ctx, |ctx| {
            Ok::<_, TransactionError>(ctx.session_mut::<MemorySession>()?.scan_prefix("domain/").len())
        })
        .unwrap();
    assert_eq!(seen, 1);

    let write = tm.transact_read_only(&mut ctx, |ctx| register(ctx, "other.tld"));
    assert!(matches!(write, Err(AppError::Transaction(e)) if e.is_state()));
    assert_eq!(store.len(), 1);
}

#[test]
fn test_threads_have_independent_contexts() {
    let store = MemoryStore::new();
    let tm = Arc::new(TransactionManager::new(
        Backend::Legacy,
        Arc::new(store.clone()),
    ));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let tm = Arc::clone(&tm);
            thread::spawn(move || {
                let mut ctx = TransactionContext::new();
                let mut times = Vec::new();
                for i in 0..10 {
                    let time = tm
                        .transact(&mut ctx, |ctx| {
                            register(ctx, &format!("w{}-{}.tld", worker, i))?;
                            thread::sleep(Duration::from_millis(1));
                            assert!(ctx.in_transaction());
                            Ok::<_, AppError>(ctx.transaction_time()?)
                        })
                        .unwrap();
                    assert!(!ctx.in_transaction());
                    times.push(time);
                }
                times
            })
        })
        .collect();

    for handle in handles {
        let times = handle.join().unwrap();
        assert!(times.windows(2).all(|pair| pair[0] < pair[1]));
    }
    assert_eq!(store.len(), 80);
    assert_eq!(store.stats().commits, 80);
}

#[test]
fn test_selector_routes_and_caches() {
    let legacy = MemoryStore::new();
    let relational = MemoryStore::new();
    let selector = BackendSelector::builder(Backend::Relational)
        .provider(Backend::Legacy, Arc::new(legacy.clone()))
        .provider(Backend::Relational, Arc::new(relational.clone()))
        .build()
        .unwrap();

    let current = selector.current().unwrap();
    assert_eq!(current.backend(), Backend::Relational);
    assert!(Arc::ptr_eq(&current, &selector.current().unwrap()));
    assert!(!selector.is_initialized(Backend::Legacy));

    let mut ctx = TransactionContext::new();
    current
        .transact(&mut ctx, |ctx| register(ctx, "current.tld"))
        .unwrap();
    assert_eq!(relational.len(), 1);
    assert!(legacy.is_empty());

    let legacy_tm = selector.legacy().unwrap();
    assert!(!Arc::ptr_eq(&legacy_tm, &current));
    legacy_tm
        .transact(&mut ctx, |ctx| register(ctx, "legacy.tld"))
        .unwrap();
    assert_eq!(legacy.len(), 1);

    selector.shutdown();
    assert!(selector.current().unwrap_err().is_configuration());
}

#[test]
fn test_shadow_run_across_selector_backends() {
    let legacy = MemoryStore::new();
    let relational = MemoryStore::new();
    let selector = BackendSelector::builder(Backend::Legacy)
        .provider(Backend::Legacy, Arc::new(legacy.clone()))
        .provider(Backend::Relational, Arc::new(relational.clone()))
        .build()
        .unwrap();
    let primary = selector.current().unwrap();
    let shadow = selector.backend(primary.backend().counterpart()).unwrap();

    let mut ctx = TransactionContext::new();
    let count = |ctx: &mut TransactionContext| -> Result<usize, AppError> {
        let session = ctx.session_mut::<MemorySession>()?;
        let next = session.scan_prefix("domain/").len();
        session.put(format!("domain/{}.tld", next), "x")?;
        Ok(next + 1)
    };

    for expected in 1..=3 {
        let verification = run_with_shadow(&primary, &shadow, &mut ctx, count).unwrap();
        assert_eq!(verification, Verification::Match(expected));
    }
    assert_eq!(legacy.snapshot(), relational.snapshot());
}

#[test]
fn test_bootstrapped_backend_end_to_end() {
    let config = PersistenceConfig::from_json_str(
        r#"{
            "url": "memory://integration",
            "current_backend": "relational",
            "log_sql_queries": true,
            "pool": { "max_pool_size": 2, "connection_timeout_ms": 500 },
            "credential": { "bucket": "secrets", "object": "sql", "key_name": "sql-key" }
        }"#,
    )
    .unwrap();
    let blobs = Arc::new(InMemoryBlobStore::new());
    blobs.put("secrets", "sql", "instance-a registry pw\n");
    let connector = Arc::new(MemoryConnector::new());

    let selector = {
        let config = config.clone();
        let blobs = Arc::clone(&blobs);
        let connector = Arc::clone(&connector);
        let mut overrides = BTreeMap::new();
        overrides.insert(POOL_MAXIMUM_SIZE.to_string(), "3".to_string());
        BackendSelector::builder(config.current_backend)
            .provider(Backend::Legacy, Arc::new(MemoryStore::new()))
            .backend(Backend::Relational, move || {
                build_provider(
                    &config,
                    blobs.as_ref(),
                    &PassthroughDecrypter,
                    connector.as_ref(),
                    &overrides,
                )
            })
            .build()
            .unwrap()
    };

    let tm = selector.current().unwrap();
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let tm = Arc::clone(&tm);
            thread::spawn(move || {
                let mut ctx = TransactionContext::new();
                for i in 0..5 {
                    tm.transact(&mut ctx, |ctx| {
                        register(ctx, &format!("b{}-{}.tld", worker, i))
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = connector.store("memory://integration").unwrap();
    assert_eq!(store.len(), 20);
    // Pooled sessions are reused, never more than the pool maximum
    assert!(store.stats().acquires <= 3);

    selector.shutdown();
}

#[test]
fn test_unknown_backend_name() {
    let err = "spanner".parse::<Backend>().unwrap_err();
    assert!(err.is_configuration());
    assert_eq!("Relational".parse::<Backend>().unwrap(), Backend::Relational);
}
