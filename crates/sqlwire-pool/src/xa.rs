//! Account-keyed session pool with global transaction association.
//!
//! Idle sessions sit on a free list and are matched to callers by
//! [`AccountKey`] equality. A session enlisted in a distributed transaction is
//! tracked by a [`TxConnection`] entry keyed by its [`Xid`]; the background
//! reaper rolls back entries that outlive `tx_timeout`.
//!
//! The free list and the transaction map are guarded by separate mutexes and
//! no code path holds both at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sqlwire_core::{
    Account, AccountKey, Error, ManagedSession, PoolError, PoolErrorKind, Result, SessionFactory,
    Xid,
};

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// XA pool configuration.
#[derive(Debug, Clone)]
pub struct XaPoolConfig {
    /// Maximum number of idle sessions kept across all accounts
    pub max_size: usize,
    /// Maximum number of idle sessions kept for one account
    pub max_per_key: usize,
    /// Lifetime of a transaction association, and the reaper period
    pub tx_timeout: Duration,
    /// Probe pooled sessions before handing them out
    pub test_on_checkout: bool,
}

impl Default for XaPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 32,
            max_per_key: 8,
            tx_timeout: Duration::from_secs(60),
            test_on_checkout: true,
        }
    }
}

impl XaPoolConfig {
    /// Create a configuration with the given total idle capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Set the per-account idle capacity.
    pub fn max_per_key(mut self, n: usize) -> Self {
        self.max_per_key = n;
        self
    }

    /// Set the transaction timeout.
    pub fn tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// Enable/disable the liveness probe on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XaPoolStats {
    /// Sessions waiting on the free list
    pub idle: usize,
    /// Transactions currently associated (including ones awaiting removal)
    pub active_transactions: usize,
    /// Sessions created through the factory
    pub created: usize,
    /// Associations rolled back by the reaper
    pub reaped: usize,
}

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle sessions closed to shrink the free list
    pub shrunk: usize,
    /// Expired transactions rolled back and returned to the free list
    pub rolled_back: usize,
    /// Expired transactions whose rollback failed; the session was closed
    pub closed: usize,
    /// Entries marked on an earlier pass and now removed from the map
    pub removed: usize,
}

/// Read-only view of a transaction association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSnapshot {
    pub refs: usize,
    pub read_only: bool,
    pub prepared: bool,
    pub ended: bool,
    pub timed_out: bool,
}

#[derive(Debug)]
struct TxState {
    refs: usize,
    read_only: bool,
    prepared: bool,
    ended: bool,
    timed_out: bool,
    /// Committed, rolled back or discarded; about to leave the map
    finished: bool,
    deadline: Instant,
}

/// A physical session enlisted in one global transaction.
struct TxConnection<S> {
    session: Option<S>,
    account: Account,
    state: TxState,
}

type Entry<S> = Arc<Mutex<TxConnection<S>>>;

struct Idle<S> {
    session: S,
    key: AccountKey,
}

struct Shared<F: SessionFactory> {
    factory: F,
    config: XaPoolConfig,
    free: Mutex<VecDeque<Idle<F::Session>>>,
    active: Mutex<HashMap<Xid, Entry<F::Session>>>,
    closed: AtomicBool,
    created: AtomicUsize,
    reaped: AtomicUsize,
}

/// Account-keyed pool of sessions that can be enlisted in XA transactions.
///
/// Cloning the pool is cheap; clones share the same free list and map.
pub struct XaPool<F: SessionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: SessionFactory> Clone for XaPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: SessionFactory> XaPool<F> {
    pub fn new(factory: F, config: XaPoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                free: Mutex::new(VecDeque::new()),
                active: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                created: AtomicUsize::new(0),
                reaped: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &XaPoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> XaPoolStats {
        let idle = self.shared.free.lock().len();
        let active_transactions = self.shared.active.lock().len();
        XaPoolStats {
            idle,
            active_transactions,
            created: self.shared.created.load(Ordering::Relaxed),
            reaped: self.shared.reaped.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Take a session for `account`.
    ///
    /// Only an idle session pooled under exactly the same account key is
    /// reused; otherwise a new one is created through the factory.
    pub fn acquire(&self, account: &Account) -> Result<F::Session> {
        self.ensure_open()?;
        let key = account.key();
        loop {
            let pooled = {
                let mut free = self.shared.free.lock();
                free.iter()
                    .rposition(|idle| idle.key == key)
                    .and_then(|pos| free.remove(pos))
            };
            let Some(Idle { mut session, .. }) = pooled else {
                break;
            };
            if !self.shared.config.test_on_checkout || session.is_alive() {
                tracing::trace!(user = key.user(), "reusing pooled session");
                return Ok(session);
            }
            tracing::debug!(user = key.user(), "discarding dead pooled session");
            session.close();
        }

        let session = self.shared.factory.create(account)?;
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(user = key.user(), "created session");
        Ok(session)
    }

    /// Return a session to the free list.
    ///
    /// A session beyond `max_per_key` for its account is closed; beyond
    /// `max_size` the oldest idle sessions are evicted.
    pub fn release(&self, session: F::Session, account: &Account) {
        let mut evicted = Vec::new();
        if self.is_closed() {
            evicted.push(session);
        } else {
            let key = account.key();
            let mut free = self.shared.free.lock();
            let same_key = free.iter().filter(|idle| idle.key == key).count();
            if same_key >= self.shared.config.max_per_key {
                evicted.push(session);
            } else {
                free.push_back(Idle { session, key });
                while free.len() > self.shared.config.max_size {
                    match free.pop_front() {
                        Some(oldest) => evicted.push(oldest.session),
                        None => break,
                    }
                }
            }
        }
        if !evicted.is_empty() {
            tracing::trace!(count = evicted.len(), "closing sessions over pool capacity");
        }
        close_all(evicted);
    }

    /// Enlist a session for `account` in a new global transaction.
    pub fn start(&self, xid: &Xid, account: &Account, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        if self.shared.active.lock().contains_key(xid) {
            return Err(duplicate_xid(xid));
        }

        let mut session = self.acquire(account)?;
        if let Err(err) = session.xa_start(xid) {
            self.discard_or_release(session, account, &err);
            return Err(err);
        }

        let tx = TxConnection {
            session: Some(session),
            account: account.clone(),
            state: TxState {
                refs: 1,
                read_only,
                prepared: false,
                ended: false,
                timed_out: false,
                finished: false,
                deadline: Instant::now() + self.shared.config.tx_timeout,
            },
        };
        let raced = {
            let mut active = self.shared.active.lock();
            if active.contains_key(xid) {
                Some(tx)
            } else {
                active.insert(xid.clone(), Arc::new(Mutex::new(tx)));
                None
            }
        };

        // Another caller enlisted the same id while our XA START was in flight.
        if let Some(mut tx) = raced {
            if let Some(mut session) = tx.session.take() {
                match abandon_branch(&mut session, xid, false) {
                    Ok(()) => self.release(session, account),
                    Err(_) => session.close(),
                }
            }
            return Err(duplicate_xid(xid));
        }

        tracing::debug!(xid = %xid, user = %account.user, read_only, "transaction started");
        Ok(())
    }

    /// Attach another participant to an active transaction.
    pub fn join(&self, xid: &Xid) -> Result<()> {
        self.run(xid, false, |state, _| {
            if state.ended || state.prepared {
                return Err(PoolError::new(
                    PoolErrorKind::UnknownXid,
                    format!("transaction {xid} is no longer active"),
                )
                .into());
            }
            state.refs += 1;
            Ok(())
        })
    }

    /// Detach a participant; the last one ends the branch (`XA END`).
    pub fn end(&self, xid: &Xid) -> Result<()> {
        self.run(xid, false, |state, session| {
            if state.refs > 1 {
                state.refs -= 1;
                return Ok(());
            }
            if !state.ended {
                session.xa_end(xid)?;
                state.ended = true;
                state.refs = 0;
            }
            Ok(())
        })
    }

    /// First phase of two-phase commit. Ends the branch first if needed.
    pub fn prepare(&self, xid: &Xid) -> Result<()> {
        self.run(xid, false, |state, session| {
            if !state.ended {
                session.xa_end(xid)?;
                state.ended = true;
                state.refs = 0;
            }
            session.xa_prepare(xid)?;
            state.prepared = true;
            Ok(())
        })
    }

    /// Commit and dissociate. A branch that was never prepared is committed
    /// in one phase.
    pub fn commit(&self, xid: &Xid) -> Result<()> {
        self.run(xid, true, |state, session| {
            if state.prepared {
                return session.xa_commit(xid, false);
            }
            if !state.ended {
                session.xa_end(xid)?;
                state.ended = true;
            }
            session.xa_commit(xid, true)
        })?;
        tracing::debug!(xid = %xid, "transaction committed");
        Ok(())
    }

    /// Roll back and dissociate.
    pub fn rollback(&self, xid: &Xid) -> Result<()> {
        self.run(xid, true, |state, session| {
            let ended = state.ended || state.prepared;
            abandon_branch(session, xid, ended)?;
            state.ended = true;
            Ok(())
        })?;
        tracing::debug!(xid = %xid, "transaction rolled back");
        Ok(())
    }

    /// Run `f` against the session enlisted in `xid`.
    pub fn with_session<R>(
        &self,
        xid: &Xid,
        f: impl FnOnce(&mut F::Session) -> Result<R>,
    ) -> Result<R> {
        self.run(xid, false, |_, session| f(session))
    }

    pub fn transaction(&self, xid: &Xid) -> Option<TxSnapshot> {
        let entry = self.shared.active.lock().get(xid).cloned()?;
        let tx = entry.lock();
        Some(TxSnapshot {
            refs: tx.state.refs,
            read_only: tx.state.read_only,
            prepared: tx.state.prepared,
            ended: tx.state.ended,
            timed_out: tx.state.timed_out,
        })
    }

    /// One reaper pass at the current time.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// One reaper pass, treating `now` as the current time.
    ///
    /// Shrinks the free list by a tenth (rounded up, oldest first), removes
    /// entries marked timed-out by an earlier pass, then marks, rolls back
    /// and dissociates every association past its deadline. An entry is
    /// rolled back at most once.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        let shrunk: Vec<F::Session> = {
            let mut free = self.shared.free.lock();
            let n = free.len().div_ceil(10);
            free.drain(..n).map(|idle| idle.session).collect()
        };
        report.shrunk = shrunk.len();
        close_all(shrunk);

        let candidates: Vec<(Xid, Entry<F::Session>)> = {
            let mut active = self.shared.active.lock();
            let before = active.len();
            // busy entries are left for the next pass
            active.retain(|_, entry| entry.try_lock().is_none_or(|tx| !tx.state.timed_out));
            report.removed = before - active.len();
            active
                .iter()
                .map(|(xid, entry)| (xid.clone(), Arc::clone(entry)))
                .collect()
        };

        for (xid, entry) in candidates {
            let reclaimed = {
                let mut guard = entry.lock();
                let tx = &mut *guard;
                if tx.state.timed_out || tx.state.finished || tx.state.deadline > now {
                    continue;
                }
                tx.state.timed_out = true;
                let ended = tx.state.ended || tx.state.prepared;
                tx.session
                    .take()
                    .map(|session| (session, tx.account.clone(), ended))
            };
            let Some((mut session, account, ended)) = reclaimed else {
                continue;
            };

            self.shared.reaped.fetch_add(1, Ordering::Relaxed);
            match abandon_branch(&mut session, &xid, ended) {
                Ok(()) => {
                    tracing::debug!(xid = %xid, "rolled back expired transaction");
                    self.release(session, &account);
                    report.rolled_back += 1;
                }
                Err(err) => {
                    tracing::warn!(xid = %xid, error = %err, "rollback of expired transaction failed, closing session");
                    session.close();
                    report.closed += 1;
                }
            }
        }

        report
    }

    /// Close every idle session and refuse further checkouts.
    ///
    /// Sessions still enlisted in transactions are closed when they come back.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let idle: Vec<F::Session> = self
            .shared
            .free
            .lock()
            .drain(..)
            .map(|idle| idle.session)
            .collect();
        close_all(idle);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::new(PoolErrorKind::Closed, "pool is closed").into());
        }
        Ok(())
    }

    fn discard_or_release(&self, mut session: F::Session, account: &Account, err: &Error) {
        if err.is_fatal_to_session() {
            session.close();
        } else {
            self.release(session, account);
        }
    }

    /// Run `op` with the association locked.
    ///
    /// The association is dropped when `op` fails fatally for the session
    /// (which is closed), or when it succeeds and `finish` is set (the
    /// session goes back to the free list).
    fn run<R>(
        &self,
        xid: &Xid,
        finish: bool,
        op: impl FnOnce(&mut TxState, &mut F::Session) -> Result<R>,
    ) -> Result<R> {
        let entry = self
            .shared
            .active
            .lock()
            .get(xid)
            .cloned()
            .ok_or_else(|| unknown_xid(xid))?;

        let mut guard = entry.lock();
        let tx = &mut *guard;
        if tx.state.finished {
            return Err(unknown_xid(xid));
        }
        if tx.state.timed_out {
            return Err(timed_out(xid));
        }
        let Some(session) = tx.session.as_mut() else {
            return Err(timed_out(xid));
        };

        let result = op(&mut tx.state, session);
        let fatal = result
            .as_ref()
            .err()
            .is_some_and(Error::is_fatal_to_session);
        if !fatal && !(finish && result.is_ok()) {
            return result;
        }

        tx.state.finished = true;
        let session = tx.session.take();
        let account = tx.account.clone();
        drop(guard);

        self.forget(xid, &entry);
        if let Some(mut session) = session {
            if fatal {
                tracing::debug!(xid = %xid, "closing session after fatal error");
                session.close();
            } else {
                self.release(session, &account);
            }
        }
        result
    }

    fn forget(&self, xid: &Xid, entry: &Entry<F::Session>) {
        let mut active = self.shared.active.lock();
        if active.get(xid).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            active.remove(xid);
        }
    }
}

impl<F> XaPool<F>
where
    F: SessionFactory + 'static,
    F::Session: 'static,
{
    /// Spawn the background reaper; it sweeps every `tx_timeout` until the
    /// handle is shut down or the pool is dropped.
    pub fn start_reaper(&self) -> Result<ReaperHandle> {
        let interval = self.shared.config.tx_timeout.max(MIN_REAP_INTERVAL);
        let signal = Arc::new(ReaperSignal::default());
        let pool = Arc::downgrade(&self.shared);
        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("sqlwire-xa-reaper".to_string())
            .spawn(move || reap_loop(&pool, &thread_signal, interval))?;
        tracing::debug!(interval = ?interval, "reaper started");
        Ok(ReaperHandle {
            signal,
            thread: Some(thread),
        })
    }
}

#[derive(Default)]
struct ReaperSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Owns the reaper thread. Dropping the handle stops it.
pub struct ReaperHandle {
    signal: Arc<ReaperSignal>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the reaper and wait for an in-progress sweep to finish.
    pub fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("reaper thread panicked");
            }
            tracing::debug!("reaper stopped");
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reap_loop<F: SessionFactory>(
    pool: &Weak<Shared<F>>,
    signal: &ReaperSignal,
    interval: Duration,
) {
    loop {
        {
            let deadline = Instant::now() + interval;
            let mut stopped = signal.stopped.lock();
            while !*stopped {
                if signal.wake.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                return;
            }
        }

        let Some(shared) = pool.upgrade() else {
            return;
        };
        let report = XaPool { shared }.sweep();
        if report != SweepReport::default() {
            tracing::debug!(
                shrunk = report.shrunk,
                rolled_back = report.rolled_back,
                closed = report.closed,
                removed = report.removed,
                "reaper pass"
            );
        }
    }
}

/// `XA END` (unless already ended) then `XA ROLLBACK`.
fn abandon_branch<S: ManagedSession>(session: &mut S, xid: &Xid, ended: bool) -> Result<()> {
    if !ended {
        session.xa_end(xid)?;
    }
    session.xa_rollback(xid)
}

fn close_all<S: ManagedSession>(sessions: Vec<S>) {
    for mut session in sessions {
        session.close();
    }
}

fn duplicate_xid(xid: &Xid) -> Error {
    PoolError::new(
        PoolErrorKind::DuplicateXid,
        format!("transaction {xid} is already associated"),
    )
    .into()
}

fn unknown_xid(xid: &Xid) -> Error {
    PoolError::new(
        PoolErrorKind::UnknownXid,
        format!("no transaction associated with {xid}"),
    )
    .into()
}

fn timed_out(xid: &Xid) -> Error {
    PoolError::new(
        PoolErrorKind::TimedOut,
        format!("transaction {xid} timed out and was rolled back"),
    )
    .into()
}
