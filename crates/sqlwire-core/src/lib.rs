//! Core types and traits for sqlwire.
//!
//! This crate provides the pieces shared by the protocol engine and the
//! connection lifecycle manager:
//!
//! - `Error` taxonomy (transport, authentication, decode, pool, routing)
//! - `Value` for dynamically typed column values
//! - `ManagedSession` / `SessionFactory` traits the pool builds on
//! - `Account` and its exact-match `AccountKey`

pub mod error;
pub mod session;
pub mod value;

pub use error::{
    AuthenticationError, AuthenticationErrorKind, ConfigError, DecodeError, DecodeErrorKind,
    Error, PoolError, PoolErrorKind, ProtocolError, Result, RoutingError, RoutingErrorKind,
    ServerError, TransportError, TransportErrorKind,
};
pub use session::{Account, AccountKey, ManagedSession, SessionFactory, Xid};
pub use value::Value;
