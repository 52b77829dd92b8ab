//! Load-balanced session routing.
//!
//! A [`LoadBalancer`] owns a fixed host list and a [`BalanceStrategy`] chosen
//! by name. `connect` asks the strategy for a host among the ones not on the
//! blocklist, opens a session through a caller-supplied closure and, on a
//! connection failure, blocklists that host and retries.

use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use sqlwire_core::{ConfigError, Error, Result, RoutingError, RoutingErrorKind};

use crate::host::{HostRecord, HostRole};

/// Strategy names understood by [`StrategyRegistry::with_defaults`].
pub mod strategies {
    pub const RANDOM: &str = "random";
    pub const BEST_RESPONSE_TIME: &str = "bestResponseTime";
    pub const SERVER_AFFINITY: &str = "serverAffinity";
}

/// Load balancing configuration.
#[derive(Debug, Clone)]
pub struct LoadBalanceConfig {
    /// `host:port` entries, in preference order for `serverAffinity`
    pub hosts: Vec<String>,
    /// Registered strategy name
    pub strategy: String,
    /// Connection attempts before giving up with `AllHostsDown`
    pub retries_all_down: u32,
    /// How long a failed host stays off the candidate list
    pub blocklist_timeout: Duration,
    /// Pause before another attempt when every host is blocklisted
    pub retry_backoff: Duration,
    /// Host order tried first by `serverAffinity`
    pub affinity_order: Vec<String>,
}

impl Default for LoadBalanceConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            strategy: strategies::RANDOM.to_string(),
            retries_all_down: 120,
            blocklist_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(250),
            affinity_order: Vec::new(),
        }
    }
}

impl LoadBalanceConfig {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = name.into();
        self
    }

    pub fn retries_all_down(mut self, n: u32) -> Self {
        self.retries_all_down = n;
        self
    }

    pub fn blocklist_timeout(mut self, timeout: Duration) -> Self {
        self.blocklist_timeout = timeout;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn affinity_order<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affinity_order = hosts.into_iter().map(Into::into).collect();
        self
    }
}

/// Picks one host out of the currently eligible ones.
pub trait BalanceStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index into `candidates`, or `None` to skip this round.
    /// `candidates` is never empty and keeps configuration order.
    fn pick(&self, candidates: &[&HostRecord]) -> Option<usize>;
}

/// Uniformly random choice.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl BalanceStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        strategies::RANDOM
    }

    fn pick(&self, candidates: &[&HostRecord]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

/// Host with the shortest last measured response; unmeasured hosts first.
#[derive(Debug, Default)]
pub struct BestResponseTimeStrategy;

impl BalanceStrategy for BestResponseTimeStrategy {
    fn name(&self) -> &'static str {
        strategies::BEST_RESPONSE_TIME
    }

    fn pick(&self, candidates: &[&HostRecord]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, host)| host.last_response.unwrap_or(Duration::ZERO))
            .map(|(i, _)| i)
    }
}

/// First available host of a fixed preference list, random otherwise.
#[derive(Debug, Default)]
pub struct ServerAffinityStrategy {
    order: Vec<String>,
}

impl ServerAffinityStrategy {
    pub fn new(order: Vec<String>) -> Self {
        Self { order }
    }
}

impl BalanceStrategy for ServerAffinityStrategy {
    fn name(&self) -> &'static str {
        strategies::SERVER_AFFINITY
    }

    fn pick(&self, candidates: &[&HostRecord]) -> Option<usize> {
        self.order
            .iter()
            .find_map(|preferred| candidates.iter().position(|host| &host.id == preferred))
            .or_else(|| RandomStrategy.pick(candidates))
    }
}

type StrategyCtor = fn(&LoadBalanceConfig) -> Box<dyn BalanceStrategy>;

/// Strategy name → constructor.
pub struct StrategyRegistry {
    ctors: HashMap<String, StrategyCtor>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// The three built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(strategies::RANDOM, |_| Box::new(RandomStrategy));
        registry.register(strategies::BEST_RESPONSE_TIME, |_| {
            Box::new(BestResponseTimeStrategy)
        });
        registry.register(strategies::SERVER_AFFINITY, |config| {
            Box::new(ServerAffinityStrategy::new(config.affinity_order.clone()))
        });
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, ctor: StrategyCtor) {
        self.ctors.insert(name.into(), ctor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    pub fn create(&self, config: &LoadBalanceConfig) -> Result<Box<dyn BalanceStrategy>> {
        let ctor = self.ctors.get(&config.strategy).ok_or_else(|| {
            Error::from(RoutingError::new(
                RoutingErrorKind::UnknownStrategy,
                format!("no load balancing strategy named '{}'", config.strategy),
            ))
        })?;
        Ok(ctor(config))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.ctors.keys().collect();
        names.sort();
        f.debug_struct("StrategyRegistry")
            .field("strategies", &names)
            .finish()
    }
}

struct BalanceState {
    hosts: Vec<HostRecord>,
    blocklist: HashMap<String, Instant>,
}

impl BalanceState {
    fn host_mut(&mut self, id: &str) -> Result<&mut HostRecord> {
        self.hosts
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| unknown_host(id))
    }

    fn purge_blocklist(&mut self, now: Instant) {
        let before = self.blocklist.len();
        self.blocklist.retain(|_, until| *until > now);
        if self.blocklist.len() != before {
            tracing::debug!(
                readmitted = before - self.blocklist.len(),
                "hosts back from blocklist"
            );
        }
    }
}

/// Routes new sessions across a fixed set of hosts.
pub struct LoadBalancer {
    config: LoadBalanceConfig,
    strategy: Box<dyn BalanceStrategy>,
    state: Mutex<BalanceState>,
}

impl LoadBalancer {
    /// Build with the built-in strategies.
    pub fn new(config: LoadBalanceConfig) -> Result<Self> {
        Self::with_registry(config, &StrategyRegistry::with_defaults())
    }

    pub fn with_registry(config: LoadBalanceConfig, registry: &StrategyRegistry) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(ConfigError {
                message: "load balancing needs at least one host".to_string(),
                source: None,
            }
            .into());
        }
        let strategy = registry.create(&config)?;
        let hosts = config
            .hosts
            .iter()
            .map(|id| HostRecord::new(id.clone(), HostRole::Source))
            .collect();
        tracing::debug!(strategy = strategy.name(), hosts = config.hosts.len(), "load balancer ready");
        Ok(Self {
            config,
            strategy,
            state: Mutex::new(BalanceState {
                hosts,
                blocklist: HashMap::new(),
            }),
        })
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn config(&self) -> &LoadBalanceConfig {
        &self.config
    }

    /// Open a session on some host.
    ///
    /// `open` is called with the chosen host id. Connection failures
    /// (transport or I/O errors) blocklist the host and trigger another
    /// attempt, up to `retries_all_down`; any other error is returned as is.
    /// On success the host's active counter is incremented; hand it back
    /// with [`release`](Self::release).
    pub fn connect<S>(&self, mut open: impl FnMut(&str) -> Result<S>) -> Result<(String, S)> {
        let attempts = self.config.retries_all_down.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let Some(host) = self.choose(Instant::now()) else {
                tracing::trace!(attempt, "every host is blocklisted");
                if attempt < attempts && !self.config.retry_backoff.is_zero() {
                    thread::sleep(self.config.retry_backoff);
                }
                continue;
            };

            let started = Instant::now();
            match open(&host) {
                Ok(session) => {
                    let mut state = self.state.lock();
                    let record = state.host_mut(&host)?;
                    record.alive = true;
                    record.last_response = Some(started.elapsed());
                    record.checkout();
                    tracing::debug!(host = %host, attempt, "connected");
                    return Ok((host, session));
                }
                Err(err) if is_connection_failure(&err) => {
                    tracing::warn!(host = %host, attempt, error = %err, "connection failed, blocklisting host");
                    self.blocklist(&host);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let mut err = RoutingError::new(
            RoutingErrorKind::AllHostsDown,
            format!("no host reachable after {attempts} attempts"),
        );
        err.source = last_error.map(Box::new);
        Err(err.into())
    }

    /// A session opened by [`connect`](Self::connect) on `host` was closed.
    pub fn release(&self, host: &str) -> Result<()> {
        self.state.lock().host_mut(host)?.checkin();
        Ok(())
    }

    /// Feed a measured exchange duration into the statistics.
    pub fn record_response(&self, host: &str, elapsed: Duration) -> Result<()> {
        self.state.lock().host_mut(host)?.last_response = Some(elapsed);
        Ok(())
    }

    /// Count a transaction routed to `host`.
    pub fn record_transaction(&self, host: &str) -> Result<()> {
        self.state.lock().host_mut(host)?.transactions += 1;
        Ok(())
    }

    pub fn is_blocklisted(&self, host: &str) -> bool {
        self.state
            .lock()
            .blocklist
            .get(host)
            .is_some_and(|until| *until > Instant::now())
    }

    /// Snapshot of every host record.
    pub fn hosts(&self) -> Vec<HostRecord> {
        self.state.lock().hosts.clone()
    }

    fn choose(&self, now: Instant) -> Option<String> {
        let mut state = self.state.lock();
        state.purge_blocklist(now);
        let candidates: Vec<&HostRecord> = state
            .hosts
            .iter()
            .filter(|h| !state.blocklist.contains_key(&h.id))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = self.strategy.pick(&candidates)?;
        candidates.get(index).map(|h| h.id.clone())
    }

    fn blocklist(&self, host: &str) {
        let mut state = self.state.lock();
        let until = Instant::now() + self.config.blocklist_timeout;
        state.blocklist.insert(host.to_string(), until);
        if let Ok(record) = state.host_mut(host) {
            record.alive = false;
        }
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy.name())
            .field("hosts", &self.config.hosts)
            .finish()
    }
}

fn is_connection_failure(err: &Error) -> bool {
    matches!(err, Error::Transport(_) | Error::Io(_))
}

fn unknown_host(host: &str) -> Error {
    RoutingError::new(RoutingErrorKind::UnknownHost, "host is not configured for load balancing")
        .with_host(host)
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlwire_core::{ServerError, TransportError, TransportErrorKind};

    fn refused() -> Error {
        TransportError::new(TransportErrorKind::ConnectionLost, "connection refused").into()
    }

    fn config(hosts: &[&str]) -> LoadBalanceConfig {
        LoadBalanceConfig::new(hosts.iter().copied())
            .retries_all_down(3)
            .blocklist_timeout(Duration::from_secs(60))
            .retry_backoff(Duration::ZERO)
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = LoadBalancer::new(config(&["a:3306"]).strategy("roundRobinish")).unwrap_err();
        assert_eq!(err.routing_kind(), Some(RoutingErrorKind::UnknownStrategy));
    }

    #[test]
    fn test_empty_host_list_is_a_config_error() {
        assert!(matches!(
            LoadBalancer::new(LoadBalanceConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_failed_host_is_blocklisted_and_skipped() {
        let balancer = LoadBalancer::new(
            config(&["a:3306", "b:3306"]).strategy(strategies::SERVER_AFFINITY)
                .affinity_order(["a:3306", "b:3306"]),
        )
        .unwrap();
        let mut tried = Vec::new();
        let (host, ()) = balancer
            .connect(|host| {
                tried.push(host.to_string());
                if host == "a:3306" { Err(refused()) } else { Ok(()) }
            })
            .unwrap();
        assert_eq!(host, "b:3306");
        assert_eq!(tried, vec!["a:3306", "b:3306"]);
        assert!(balancer.is_blocklisted("a:3306"));

        let hosts = balancer.hosts();
        assert!(!hosts[0].alive);
        assert_eq!(hosts[1].active_connections, 1);

        // a stays off the list during its cool-down
        let (host, ()) = balancer.connect(|_| Ok(())).unwrap();
        assert_eq!(host, "b:3306");
    }

    #[test]
    fn test_all_hosts_down_after_retry_bound() {
        let balancer = LoadBalancer::new(config(&["a:3306", "b:3306"])).unwrap();
        let mut calls = 0;
        let err = balancer
            .connect::<()>(|_| {
                calls += 1;
                Err(refused())
            })
            .unwrap_err();
        assert_eq!(err.routing_kind(), Some(RoutingErrorKind::AllHostsDown));
        // third attempt finds both hosts blocklisted
        assert_eq!(calls, 2);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_host_readmitted_after_cool_down() {
        let balancer = LoadBalancer::new(
            config(&["a:3306"]).blocklist_timeout(Duration::ZERO),
        )
        .unwrap();
        let mut failed_once = false;
        let (host, ()) = balancer
            .connect(|_| {
                if failed_once {
                    Ok(())
                } else {
                    failed_once = true;
                    Err(refused())
                }
            })
            .unwrap();
        assert_eq!(host, "a:3306");
        assert!(balancer.hosts()[0].alive);
    }

    #[test]
    fn test_non_connection_errors_are_not_retried() {
        let balancer = LoadBalancer::new(config(&["a:3306", "b:3306"])).unwrap();
        let mut calls = 0;
        let err = balancer
            .connect::<()>(|_| {
                calls += 1;
                Err(ServerError {
                    code: 1045,
                    sqlstate: "28000".to_string(),
                    message: "Access denied".to_string(),
                }
                .into())
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, Error::Server(_)));
    }

    #[test]
    fn test_best_response_time_prefers_fastest() {
        let balancer = LoadBalancer::new(
            config(&["a:3306", "b:3306", "c:3306"]).strategy(strategies::BEST_RESPONSE_TIME),
        )
        .unwrap();
        balancer.record_response("a:3306", Duration::from_millis(30)).unwrap();
        balancer.record_response("b:3306", Duration::from_millis(5)).unwrap();
        balancer.record_response("c:3306", Duration::from_millis(12)).unwrap();
        let picked = balancer.choose(Instant::now());
        assert_eq!(picked.as_deref(), Some("b:3306"));
    }

    #[test]
    fn test_release_and_unknown_host() {
        let balancer = LoadBalancer::new(config(&["a:3306"])).unwrap();
        let (host, ()) = balancer.connect(|_| Ok(())).unwrap();
        balancer.record_transaction(&host).unwrap();
        balancer.release(&host).unwrap();
        let record = &balancer.hosts()[0];
        assert_eq!(record.active_connections, 0);
        assert_eq!(record.transactions, 1);

        let err = balancer.release("zzz:1").unwrap_err();
        assert_eq!(err.routing_kind(), Some(RoutingErrorKind::UnknownHost));
    }
}
