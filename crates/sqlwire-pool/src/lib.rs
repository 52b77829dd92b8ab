//! Session lifecycle management for sqlwire.
//!
//! This crate manages whole sessions, never packets:
//!
//! - [`XaPool`]: account-keyed free list, XA transaction association and a
//!   background reaper for expired transactions
//! - [`LoadBalancer`]: pluggable host selection with retry and blocklisting
//! - [`ReplicationGroupRegistry`]: source/replica sets per named group with
//!   promotion and graceful removal
//!
//! Sessions come from any [`SessionFactory`](sqlwire_core::SessionFactory);
//! `sqlwire-mysql` provides one for MySQL.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_core::{Account, Xid};
//! use sqlwire_mysql::{MySqlConfig, MySqlSessionFactory};
//! use sqlwire_pool::{XaPool, XaPoolConfig};
//!
//! let factory = MySqlSessionFactory::new(MySqlConfig::new().host("db1"));
//! let pool = XaPool::new(factory, XaPoolConfig::new(16));
//! let _reaper = pool.start_reaper()?;
//!
//! let account = Account::new("app", Some("secret".into()));
//! let xid = Xid::new(1, b"order-42".to_vec(), Vec::new());
//! pool.start(&xid, &account, false)?;
//! pool.with_session(&xid, |session| session.execute("UPDATE stock SET n = n - 1").map(drop))?;
//! pool.prepare(&xid)?;
//! pool.commit(&xid)?;
//! ```

pub mod balance;
pub mod host;
pub mod replication;
pub mod xa;

pub use balance::{
    BalanceStrategy, BestResponseTimeStrategy, LoadBalanceConfig, LoadBalancer, RandomStrategy,
    ServerAffinityStrategy, StrategyRegistry,
};
pub use host::{HostRecord, HostRole};
pub use replication::{
    HostLease, RemovalMode, ReplicationGroup, ReplicationGroupConfig, ReplicationGroupRegistry,
};
pub use xa::{ReaperHandle, SweepReport, TxSnapshot, XaPool, XaPoolConfig, XaPoolStats};
