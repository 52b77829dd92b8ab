//! Pool, reaper and routing working together across threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlwire_core::{
    Account, ManagedSession, PoolErrorKind, Result, SessionFactory, TransportError,
    TransportErrorKind, Xid,
};
use sqlwire_pool::{
    LoadBalanceConfig, LoadBalancer, RemovalMode, ReplicationGroupConfig,
    ReplicationGroupRegistry, XaPool, XaPoolConfig,
};

#[derive(Default)]
struct Journal {
    rollbacks: AtomicUsize,
    closes: AtomicUsize,
    users: Mutex<Vec<String>>,
}

struct Session {
    user: String,
    journal: Arc<Journal>,
}

impl ManagedSession for Session {
    fn xa_start(&mut self, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    fn xa_end(&mut self, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    fn xa_prepare(&mut self, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    fn xa_commit(&mut self, _xid: &Xid, _one_phase: bool) -> Result<()> {
        Ok(())
    }

    fn xa_rollback(&mut self, _xid: &Xid) -> Result<()> {
        self.journal.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn close(&mut self) {
        self.journal.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Factory {
    journal: Arc<Journal>,
}

impl SessionFactory for Factory {
    type Session = Session;

    fn create(&self, account: &Account) -> Result<Session> {
        self.journal.users.lock().push(account.user.clone());
        Ok(Session {
            user: account.user.clone(),
            journal: Arc::clone(&self.journal),
        })
    }
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_background_reaper_rolls_back_expired_transaction() {
    let factory = Factory::default();
    let journal = Arc::clone(&factory.journal);
    let pool = XaPool::new(
        factory,
        XaPoolConfig::default().tx_timeout(Duration::from_millis(20)),
    );
    let mut reaper = pool.start_reaper().unwrap();

    let account = Account::new("batch", Some("pw".to_string()));
    let xid = Xid::new(7, b"nightly".to_vec(), Vec::new());
    pool.start(&xid, &account, false).unwrap();

    assert!(wait_for(|| pool.transaction(&xid).is_none()));
    assert_eq!(journal.rollbacks.load(Ordering::SeqCst), 1);
    let err = pool.commit(&xid).unwrap_err();
    assert_eq!(err.pool_kind(), Some(PoolErrorKind::UnknownXid));

    reaper.shutdown();
    assert!(!reaper.is_running());
}

#[test]
fn test_concurrent_checkout_keeps_accounts_apart() {
    let pool = XaPool::new(
        Factory::default(),
        XaPoolConfig::new(64).max_per_key(16).test_on_checkout(false),
    );
    let workers: Vec<_> = (0..4)
        .map(|n| {
            let pool = pool.clone();
            thread::spawn(move || {
                let account = Account::new(format!("user{n}"), Some(format!("pw{n}")));
                for _ in 0..50 {
                    let session = pool.acquire(&account).unwrap();
                    assert_eq!(session.user, account.user);
                    pool.release(session, &account);
                }
            })
        })
        .collect();
    for _ in 0..20 {
        pool.sweep();
    }
    for worker in workers {
        worker.join().unwrap();
    }
    let stats = pool.stats();
    assert!(stats.idle <= 4);
    assert_eq!(stats.active_transactions, 0);
}

#[test]
fn test_parallel_starts_of_one_xid_yield_one_association() {
    let pool = XaPool::new(Factory::default(), XaPoolConfig::default());
    let xid = Xid::new(1, b"shared".to_vec(), Vec::new());
    let results: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let xid = xid.clone();
            thread::spawn(move || pool.start(&xid, &Account::new("app", None), false))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.pool_kind(), Some(PoolErrorKind::DuplicateXid));
    }
    assert_eq!(pool.stats().active_transactions, 1);
    pool.rollback(&xid).unwrap();
    assert_eq!(pool.stats().active_transactions, 0);
}

#[test]
fn test_replica_routing_with_failover() {
    let registry = ReplicationGroupRegistry::from_configs(&[ReplicationGroupConfig::new("shop")
        .source("s1:3306")
        .replica("r1:3306")
        .replica("r2:3306")]);
    let group = registry.group("shop").unwrap();

    let balancer = LoadBalancer::new(
        LoadBalanceConfig::new(group.replicas())
            .strategy("serverAffinity")
            .affinity_order(["r1:3306"])
            .retries_all_down(4)
            .retry_backoff(Duration::ZERO),
    )
    .unwrap();

    let (host, lease) = balancer
        .connect(|host| {
            if host == "r1:3306" {
                return Err(TransportError::new(TransportErrorKind::ConnectionLost, "refused").into());
            }
            group.lease(host)
        })
        .unwrap();
    assert_eq!(host, "r2:3306");
    assert_eq!(group.active_leases("r2:3306"), 1);

    // r1 is unreachable: take it out and promote r2 once its session is done
    registry
        .remove_host("shop", "r1:3306", RemovalMode::Graceful(Some(Duration::from_millis(50))))
        .unwrap();
    drop(lease);
    balancer.release(&host).unwrap();
    assert!(registry.promote("shop", "r2:3306").unwrap());
    assert_eq!(group.sources(), vec!["s1:3306", "r2:3306"]);
    assert!(group.replicas().is_empty());
}
