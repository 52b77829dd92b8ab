//! MySQL wire protocol engine for sqlwire.
//!
//! This crate implements the client side of the MySQL protocol over any byte
//! channel. It provides:
//!
//! - Packet framing with sequence numbers, payload splitting and the zlib
//!   compression envelope
//! - The handshake and pluggable authentication (mysql_native_password,
//!   mysql_clear_password, sha256_password, caching_sha2_password)
//! - Optional TLS upgrade (`tls` feature, rustls)
//! - Server session state tracking (status flags, transaction phase,
//!   session-track variables, charsets)
//! - Binary and text protocol value decoding through a [`ValueFactory`]
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlSession};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut session = MySqlSession::connect(config)?;
//! let result = session.execute("SELECT 1")?;
//! ```

pub mod auth;
pub mod charset;
pub mod config;
pub mod decode;
pub mod handshake;
pub mod interceptor;
pub mod protocol;
pub mod row;
pub mod session;
pub mod state;
pub mod tls;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use auth::{AuthOptions, AuthPlugin, AuthStep, PluginRegistry};
pub use config::MySqlConfig;
pub use decode::{
    ColumnDecoder, I64ValueFactory, SqlValueFactory, StringValueFactory, ValueFactory,
    ZeroDateBehavior,
};
pub use handshake::{Greeting, Handshake, HandshakeState, Negotiated};
pub use interceptor::{InterceptorChain, QueryInterceptor};
pub use row::Row;
pub use session::{MySqlSession, MySqlSessionFactory, QueryResult};
pub use state::{ServerSessionState, TransactionPhase};
pub use tls::{SslMode, TlsConfig, TlsUpgrader};
pub use transport::{Channel, ChannelShutdown, CloseHandle, PacketTransport};
pub use types::{ColumnDefinition, FieldType};
