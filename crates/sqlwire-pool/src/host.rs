//! Per-host bookkeeping shared by the balancer and replication groups.

use std::fmt;
use std::time::Duration;

/// Role of a host inside a replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostRole {
    Source,
    Replica,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Source => f.write_str("source"),
            HostRole::Replica => f.write_str("replica"),
        }
    }
}

/// Live statistics for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// `host:port` identifier
    pub id: String,
    pub role: HostRole,
    /// Cleared when a connection attempt fails, set again on success
    pub alive: bool,
    /// Sessions currently handed out against this host
    pub active_connections: usize,
    /// Transactions routed to this host since it was added
    pub transactions: u64,
    /// Duration of the most recent measured exchange
    pub last_response: Option<Duration>,
}

impl HostRecord {
    pub fn new(id: impl Into<String>, role: HostRole) -> Self {
        Self {
            id: id.into(),
            role,
            alive: true,
            active_connections: 0,
            transactions: 0,
            last_response: None,
        }
    }

    pub fn is_source(&self) -> bool {
        self.role == HostRole::Source
    }

    pub(crate) fn checkout(&mut self) {
        self.active_connections += 1;
    }

    pub(crate) fn checkin(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_host_is_alive_and_idle() {
        let host = HostRecord::new("db1:3306", HostRole::Replica);
        assert!(host.alive);
        assert!(!host.is_source());
        assert_eq!(host.active_connections, 0);
        assert_eq!(host.last_response, None);
    }

    #[test]
    fn test_checkin_never_underflows() {
        let mut host = HostRecord::new("db1:3306", HostRole::Source);
        host.checkout();
        host.checkin();
        host.checkin();
        assert_eq!(host.active_connections, 0);
        assert_eq!(HostRole::Source.to_string(), "source");
    }
}
