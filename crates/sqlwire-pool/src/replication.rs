//! Source/replica bookkeeping for replication groups.
//!
//! Each [`ReplicationGroup`] keeps disjoint source and replica sets. Callers
//! route a session to a host by taking a [`HostLease`]; a graceful removal
//! waits until every lease on the host has been dropped.
//!
//! Groups live in an explicitly constructed [`ReplicationGroupRegistry`]
//! that callers own and pass where needed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use sqlwire_core::{Error, Result, RoutingError, RoutingErrorKind};

use crate::host::{HostRecord, HostRole};

/// Membership of one replication group.
#[derive(Debug, Clone, Default)]
pub struct ReplicationGroupConfig {
    pub name: String,
    pub sources: Vec<String>,
    pub replicas: Vec<String>,
}

impl ReplicationGroupConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn source(mut self, host: impl Into<String>) -> Self {
        self.sources.push(host.into());
        self
    }

    pub fn replica(mut self, host: impl Into<String>) -> Self {
        self.replicas.push(host.into());
        self
    }
}

/// How [`ReplicationGroup::remove`] treats in-flight sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    /// Wait until no lease references the host; `None` waits forever.
    Graceful(Option<Duration>),
    /// Remove immediately; outstanding leases become no-ops.
    Forced,
}

struct Member {
    record: HostRecord,
    draining: bool,
    /// Distinguishes a re-added host from the membership it replaced.
    generation: u64,
}

#[derive(Default)]
struct GroupState {
    /// Insertion order is kept for listing
    members: Vec<Member>,
    next_generation: u64,
}

impl GroupState {
    fn find(&self, host: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.record.id == host)
    }

    fn find_generation(&mut self, host: &str, generation: u64) -> Option<&mut Member> {
        self.find_mut(host).filter(|m| m.generation == generation)
    }

    fn find_mut(&mut self, host: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.record.id == host)
    }

    fn ids(&self, role: HostRole) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.record.role == role)
            .map(|m| m.record.id.clone())
            .collect()
    }
}

struct GroupInner {
    name: String,
    state: Mutex<GroupState>,
    drained: Condvar,
}

/// A named set of source and replica hosts.
///
/// Clones share state.
#[derive(Clone)]
pub struct ReplicationGroup {
    inner: Arc<GroupInner>,
}

impl ReplicationGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name: name.into(),
                state: Mutex::new(GroupState::default()),
                drained: Condvar::new(),
            }),
        }
    }

    pub fn from_config(config: &ReplicationGroupConfig) -> Self {
        let group = Self::new(config.name.clone());
        for host in &config.sources {
            group.add_source(host);
        }
        for host in &config.replicas {
            group.add_replica(host);
        }
        group
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add `host` as a source. A current replica is moved over.
    /// Returns whether membership changed.
    pub fn add_source(&self, host: &str) -> bool {
        self.add(host, HostRole::Source)
    }

    /// Add `host` as a replica. A current source is moved over.
    /// Returns whether membership changed.
    pub fn add_replica(&self, host: &str) -> bool {
        self.add(host, HostRole::Replica)
    }

    /// Move a replica into the source set. Promoting a source is a no-op
    /// that returns `Ok(false)`.
    pub fn promote(&self, host: &str) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let member = state
            .find_mut(host)
            .ok_or_else(|| unknown_host(&self.inner.name, host))?;
        if member.record.is_source() {
            return Ok(false);
        }
        member.record.role = HostRole::Source;
        tracing::debug!(group = %self.inner.name, host, "promoted replica to source");
        Ok(true)
    }

    /// Remove `host` from the group.
    ///
    /// A graceful removal stops new leases on the host right away, then waits
    /// for outstanding ones; if the timeout elapses first the host stays a
    /// member and `RemovalTimeout` is returned.
    pub fn remove(&self, host: &str, mode: RemovalMode) -> Result<()> {
        let mut state = self.inner.state.lock();
        let member = state
            .find_mut(host)
            .ok_or_else(|| unknown_host(&self.inner.name, host))?;
        let generation = member.generation;

        if let RemovalMode::Graceful(timeout) = mode {
            member.draining = true;
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                let in_flight = state
                    .find_generation(host, generation)
                    .map_or(0, |m| m.record.active_connections);
                if in_flight == 0 {
                    break;
                }
                tracing::trace!(group = %self.inner.name, host, in_flight, "waiting for host to drain");
                match deadline {
                    Some(deadline) => {
                        if self.inner.drained.wait_until(&mut state, deadline).timed_out() {
                            let in_flight = state
                                .find_generation(host, generation)
                                .map_or(0, |m| m.record.active_connections);
                            if in_flight == 0 {
                                break;
                            }
                            if let Some(member) = state.find_generation(host, generation) {
                                member.draining = false;
                            }
                            return Err(RoutingError::new(
                                RoutingErrorKind::RemovalTimeout,
                                format!(
                                    "{in_flight} session(s) still on host in group '{}'",
                                    self.inner.name
                                ),
                            )
                            .with_host(host)
                            .into());
                        }
                    }
                    None => self.inner.drained.wait(&mut state),
                }
            }
        }

        let before = state.members.len();
        state
            .members
            .retain(|m| m.record.id != host || m.generation != generation);
        if state.members.len() != before {
            tracing::debug!(group = %self.inner.name, host, ?mode, "host removed");
        }
        Ok(())
    }

    /// Reference `host` for the lifetime of the returned lease.
    pub fn lease(&self, host: &str) -> Result<HostLease> {
        let mut state = self.inner.state.lock();
        let member = state
            .find_mut(host)
            .ok_or_else(|| unknown_host(&self.inner.name, host))?;
        if member.draining {
            return Err(RoutingError::new(
                RoutingErrorKind::UnknownHost,
                format!("host is being removed from group '{}'", self.inner.name),
            )
            .with_host(host)
            .into());
        }
        member.record.checkout();
        member.record.transactions += 1;
        Ok(HostLease {
            group: Arc::clone(&self.inner),
            host: host.to_string(),
            generation: member.generation,
        })
    }

    pub fn sources(&self) -> Vec<String> {
        self.inner.state.lock().ids(HostRole::Source)
    }

    pub fn replicas(&self) -> Vec<String> {
        self.inner.state.lock().ids(HostRole::Replica)
    }

    pub fn role(&self, host: &str) -> Option<HostRole> {
        self.inner.state.lock().find(host).map(|m| m.record.role)
    }

    pub fn is_source(&self, host: &str) -> bool {
        self.role(host) == Some(HostRole::Source)
    }

    pub fn is_replica(&self, host: &str) -> bool {
        self.role(host) == Some(HostRole::Replica)
    }

    /// Snapshot of one host's record.
    pub fn host(&self, host: &str) -> Option<HostRecord> {
        self.inner.state.lock().find(host).map(|m| m.record.clone())
    }

    pub fn active_leases(&self, host: &str) -> usize {
        self.inner
            .state
            .lock()
            .find(host)
            .map_or(0, |m| m.record.active_connections)
    }

    fn add(&self, host: &str, role: HostRole) -> bool {
        let mut state = self.inner.state.lock();
        if let Some(member) = state.find_mut(host) {
            if member.record.role == role {
                return false;
            }
            member.record.role = role;
        } else {
            let generation = state.next_generation;
            state.next_generation += 1;
            state.members.push(Member {
                record: HostRecord::new(host, role),
                draining: false,
                generation,
            });
        }
        tracing::debug!(group = %self.inner.name, host, %role, "host added");
        true
    }
}

impl fmt::Debug for ReplicationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ReplicationGroup")
            .field("name", &self.inner.name)
            .field("sources", &state.ids(HostRole::Source))
            .field("replicas", &state.ids(HostRole::Replica))
            .finish()
    }
}

/// An in-flight reference to a host. Dropping it releases the reference.
///
/// A lease only ever releases the membership it was taken on; once that host
/// is removed, dropping the lease does nothing even if the host is re-added.
pub struct HostLease {
    group: Arc<GroupInner>,
    host: String,
    generation: u64,
}

impl HostLease {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn group(&self) -> &str {
        &self.group.name
    }
}

impl fmt::Debug for HostLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLease")
            .field("group", &self.group.name)
            .field("host", &self.host)
            .finish()
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        let mut state = self.group.state.lock();
        if let Some(member) = state.find_generation(&self.host, self.generation) {
            member.record.checkin();
        }
        drop(state);
        self.group.drained.notify_all();
    }
}

/// Named replication groups, built from configuration.
#[derive(Default)]
pub struct ReplicationGroupRegistry {
    groups: RwLock<HashMap<String, ReplicationGroup>>,
}

impl ReplicationGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a ReplicationGroupConfig>) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.register(ReplicationGroup::from_config(config));
        }
        registry
    }

    /// Add or replace a group under its own name.
    pub fn register(&self, group: ReplicationGroup) -> Option<ReplicationGroup> {
        self.groups.write().insert(group.name().to_string(), group)
    }

    pub fn unregister(&self, name: &str) -> Option<ReplicationGroup> {
        self.groups.write().remove(name)
    }

    pub fn group(&self, name: &str) -> Result<ReplicationGroup> {
        self.groups.read().get(name).cloned().ok_or_else(|| {
            Error::from(RoutingError::new(
                RoutingErrorKind::UnknownGroup,
                format!("no replication group named '{name}'"),
            ))
        })
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn promote(&self, group: &str, host: &str) -> Result<bool> {
        self.group(group)?.promote(host)
    }

    pub fn remove_host(&self, group: &str, host: &str, mode: RemovalMode) -> Result<()> {
        self.group(group)?.remove(host, mode)
    }

    /// Drop every group.
    pub fn clear(&self) {
        self.groups.write().clear();
    }
}

impl fmt::Debug for ReplicationGroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationGroupRegistry")
            .field("groups", &self.group_names())
            .finish()
    }
}

fn unknown_host(group: &str, host: &str) -> Error {
    RoutingError::new(
        RoutingErrorKind::UnknownHost,
        format!("host is not a member of group '{group}'"),
    )
    .with_host(host)
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn group() -> ReplicationGroup {
        ReplicationGroup::from_config(
            &ReplicationGroupConfig::new("orders")
                .source("s1:3306")
                .replica("r1:3306")
                .replica("r2:3306"),
        )
    }

    #[test]
    fn test_sets_are_disjoint() {
        let g = group();
        assert_eq!(g.sources(), vec!["s1:3306"]);
        assert_eq!(g.replicas(), vec!["r1:3306", "r2:3306"]);
        assert!(g.add_source("r1:3306"));
        assert_eq!(g.sources(), vec!["s1:3306", "r1:3306"]);
        assert!(!g.is_replica("r1:3306"));
        assert!(!g.add_source("r1:3306"));
    }

    #[test]
    fn test_promote_is_idempotent() {
        let g = group();
        assert!(g.promote("r1:3306").unwrap());
        assert!(!g.promote("r1:3306").unwrap());
        assert!(!g.promote("s1:3306").unwrap());
        assert_eq!(g.role("r1:3306"), Some(HostRole::Source));
        let err = g.promote("nope:1").unwrap_err();
        assert_eq!(err.routing_kind(), Some(RoutingErrorKind::UnknownHost));
    }

    #[test]
    fn test_role_queries_do_not_touch_counters() {
        let g = group();
        let before = g.host("r1:3306").unwrap();
        let _ = g.role("r1:3306");
        let _ = g.is_source("r1:3306");
        let _ = g.replicas();
        assert_eq!(g.host("r1:3306").unwrap(), before);
    }

    #[test]
    fn test_lease_counts_and_drop_releases() {
        let g = group();
        let lease = g.lease("r2:3306").unwrap();
        assert_eq!(lease.host(), "r2:3306");
        assert_eq!(g.active_leases("r2:3306"), 1);
        drop(lease);
        assert_eq!(g.active_leases("r2:3306"), 0);
        assert_eq!(g.host("r2:3306").unwrap().transactions, 1);
    }

    #[test]
    fn test_forced_removal_ignores_leases() {
        let g = group();
        let lease = g.lease("r1:3306").unwrap();
        g.remove("r1:3306", RemovalMode::Forced).unwrap();
        assert_eq!(g.role("r1:3306"), None);
        drop(lease);
    }

    #[test]
    fn test_stale_lease_does_not_touch_readded_host() {
        let g = group();
        let stale = g.lease("r1:3306").unwrap();
        g.remove("r1:3306", RemovalMode::Forced).unwrap();
        assert!(g.add_replica("r1:3306"));
        let fresh = g.lease("r1:3306").unwrap();
        assert_eq!(g.active_leases("r1:3306"), 1);

        drop(stale);
        assert_eq!(g.active_leases("r1:3306"), 1);

        // a role move keeps the membership, so the fresh lease still counts
        assert!(g.promote("r1:3306").unwrap());
        drop(fresh);
        assert_eq!(g.active_leases("r1:3306"), 0);
        g.remove("r1:3306", RemovalMode::Graceful(Some(Duration::ZERO))).unwrap();
        assert_eq!(g.role("r1:3306"), None);
    }

    #[test]
    fn test_graceful_removal_times_out_and_restores_host() {
        let g = group();
        let _lease = g.lease("r1:3306").unwrap();
        let err = g
            .remove("r1:3306", RemovalMode::Graceful(Some(Duration::from_millis(20))))
            .unwrap_err();
        assert_eq!(err.routing_kind(), Some(RoutingErrorKind::RemovalTimeout));
        assert!(g.is_replica("r1:3306"));
        assert!(g.lease("r1:3306").is_ok());
    }

    #[test]
    fn test_graceful_removal_waits_for_drain() {
        let g = group();
        let lease = g.lease("r1:3306").unwrap();
        let remover = {
            let g = g.clone();
            thread::spawn(move || g.remove("r1:3306", RemovalMode::Graceful(None)))
        };
        // new leases are refused while draining
        while g.lease("r1:3306").is_ok() {
            thread::yield_now();
        }
        drop(lease);
        remover.join().unwrap().unwrap();
        assert_eq!(g.role("r1:3306"), None);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ReplicationGroupRegistry::from_configs(&[
            ReplicationGroupConfig::new("orders").source("s1:3306"),
            ReplicationGroupConfig::new("billing").source("s2:3306").replica("r9:3306"),
        ]);
        assert_eq!(registry.group_names(), vec!["billing", "orders"]);
        assert!(registry.promote("billing", "r9:3306").unwrap());
        let err = registry.group("missing").unwrap_err();
        assert_eq!(err.routing_kind(), Some(RoutingErrorKind::UnknownGroup));
        registry.clear();
        assert!(registry.group_names().is_empty());
    }
}
