//! Error types for sqlwire operations.
//!
//! Every failure maps to exactly one kind:
//!
//! - `Transport` is fatal to the session and never retried by the transport.
//! - `Authentication` is fatal to the connection attempt.
//! - `Decode` is fatal to the current row only; the transport stays usable.
//! - `Pool` is recovered by creating a fresh session.
//! - `Routing` is surfaced after the strategy's bounded retries are spent.

use std::fmt;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Byte-channel and framing errors
    Transport(TransportError),
    /// Authentication plugin or server rejection
    Authentication(AuthenticationError),
    /// Value decoding errors
    Decode(DecodeError),
    /// Malformed server packets
    Protocol(ProtocolError),
    /// ERR packet returned by the server for a command
    Server(ServerError),
    /// Pool errors
    Pool(PoolError),
    /// Load-balancing and failover errors
    Routing(RoutingError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors outside the packet transport (key files, etc.)
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Peer went away or the channel failed
    ConnectionLost,
    /// Configured read timeout elapsed
    Timeout,
    /// Sequence number mismatch or impossible framing
    ProtocolDesync,
    /// Transport already closed
    Closed,
    /// TLS upgrade failed
    Tls,
}

#[derive(Debug)]
pub struct AuthenticationError {
    pub kind: AuthenticationErrorKind,
    pub plugin: Option<String>,
    pub message: String,
    pub server_code: Option<u16>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationErrorKind {
    /// Server answered with an ERR packet
    Rejected,
    /// Plugin could not produce a response
    PluginFailure,
    /// Plugin needs an encrypted channel and the channel is plaintext
    RequiresConfidentiality,
    /// Server public key requested but retrieval is disabled
    PublicKeyRetrievalNotAllowed,
    /// Public key file unreadable or not a valid RSA key
    MalformedKey,
    /// Plugin unknown or disabled
    UnsupportedPlugin,
}

#[derive(Debug)]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub column: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Wire type id or type name not recognized
    UnknownType,
    /// Bytes do not have the layout the type requires
    Malformed,
    /// Fixed-point text is not a valid decimal
    MalformedDecimal,
    /// Zero date while zero dates are disallowed
    ZeroDate,
    /// Collation id not present in the charset table
    UnknownCharset,
    /// Charset known but no decoder implemented for it
    UnsupportedEncoding,
    /// Value does not fit the requested target type
    OutOfRange,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No pooled session for the requested account
    NoMatch,
    /// Transaction association was reaped after its deadline
    TimedOut,
    /// A transaction with this id is already associated
    DuplicateXid,
    /// No transaction associated with this id
    UnknownXid,
    /// Pool has been shut down
    Closed,
}

#[derive(Debug)]
pub struct RoutingError {
    pub kind: RoutingErrorKind,
    pub host: Option<String>,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingErrorKind {
    /// Every configured host failed within the retry bound
    AllHostsDown,
    /// Host is not a member of the group
    UnknownHost,
    /// Replication group not registered
    UnknownGroup,
    /// Graceful removal did not drain in time
    RemovalTimeout,
    /// Balance strategy name not registered
    UnknownStrategy,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Classify an I/O failure: timeouts become `Timeout`, everything else `ConnectionLost`.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::Timeout
            }
            _ => TransportErrorKind::ConnectionLost,
        };
        Self {
            kind,
            message: format!("{context}: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

impl AuthenticationError {
    pub fn new(kind: AuthenticationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            plugin: None,
            message: message.into(),
            server_code: None,
            source: None,
        }
    }

    /// Attach the plugin name the failure happened in.
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            column: None,
            message: message.into(),
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl PoolError {
    pub fn new(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }
}

impl RoutingError {
    pub fn new(kind: RoutingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            host: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

impl Error {
    /// Does this error leave the session unusable?
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Authentication(_) | Error::Protocol(_)
        )
    }

    /// Can the caller reasonably retry (possibly on a fresh session)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(t) => matches!(
                t.kind,
                TransportErrorKind::ConnectionLost | TransportErrorKind::Timeout
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::NoMatch | PoolErrorKind::TimedOut),
            _ => false,
        }
    }

    /// Transport error kind, if this is a transport error.
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Error::Transport(t) => Some(t.kind),
            _ => None,
        }
    }

    /// Authentication error kind, if this is an authentication error.
    pub fn auth_kind(&self) -> Option<AuthenticationErrorKind> {
        match self {
            Error::Authentication(a) => Some(a.kind),
            _ => None,
        }
    }

    /// Decode error kind, if this is a decode error.
    pub fn decode_kind(&self) -> Option<DecodeErrorKind> {
        match self {
            Error::Decode(d) => Some(d.kind),
            _ => None,
        }
    }

    /// Pool error kind, if this is a pool error.
    pub fn pool_kind(&self) -> Option<PoolErrorKind> {
        match self {
            Error::Pool(p) => Some(p.kind),
            _ => None,
        }
    }

    /// Routing error kind, if this is a routing error.
    pub fn routing_kind(&self) -> Option<RoutingErrorKind> {
        match self {
            Error::Routing(r) => Some(r.kind),
            _ => None,
        }
    }

    /// Get SQLSTATE if the server reported one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(s) if !s.sqlstate.is_empty() => Some(&s.sqlstate),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error ({:?}): {}", e.kind, e.message),
            Error::Authentication(e) => {
                if let Some(plugin) = &e.plugin {
                    write!(f, "Authentication error [{}]: {}", plugin, e.message)
                } else {
                    write!(f, "Authentication error: {}", e.message)
                }
            }
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Routing(e) => write!(f, "Routing error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Authentication(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Routing(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(f, "column '{}': {}", col, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sqlstate.is_empty() {
            write!(f, "{} ({})", self.message, self.code)
        } else {
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, self.sqlstate)
        }
    }
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{} (host {})", self.message, host)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl From<AuthenticationError> for Error {
    fn from(err: AuthenticationError) -> Self {
        Error::Authentication(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<RoutingError> for Error {
    fn from(err: RoutingError) -> Self {
        Error::Routing(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_classify_as_transport_timeout() {
        let err = TransportError::from_io(
            "read",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"),
        );
        assert_eq!(err.kind, TransportErrorKind::Timeout);

        let err = TransportError::from_io(
            "read",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "gone"),
        );
        assert_eq!(err.kind, TransportErrorKind::ConnectionLost);
    }

    #[test]
    fn session_fatality() {
        let transport: Error = TransportError::new(TransportErrorKind::Closed, "closed").into();
        assert!(transport.is_fatal_to_session());

        let decode: Error = DecodeError::new(DecodeErrorKind::UnknownType, "type 0x42").into();
        assert!(!decode.is_fatal_to_session());

        let auth: Error = AuthenticationError::new(
            AuthenticationErrorKind::RequiresConfidentiality,
            "plugin requires confidentiality",
        )
        .into();
        assert!(auth.is_fatal_to_session());
        assert_eq!(
            auth.auth_kind(),
            Some(AuthenticationErrorKind::RequiresConfidentiality)
        );
    }

    #[test]
    fn retryable_flags() {
        let pool: Error = PoolError::new(PoolErrorKind::TimedOut, "reaped").into();
        assert!(pool.is_retryable());

        let desync: Error =
            TransportError::new(TransportErrorKind::ProtocolDesync, "seq 3 != 2").into();
        assert!(!desync.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err: Error = DecodeError::new(DecodeErrorKind::Malformed, "need 4 bytes")
            .with_column("id")
            .into();
        assert_eq!(err.to_string(), "Decode error: column 'id': need 4 bytes");

        let err = Error::Server(ServerError {
            code: 1045,
            sqlstate: "28000".to_string(),
            message: "Access denied".to_string(),
        });
        assert_eq!(err.sqlstate(), Some("28000"));
        assert!(err.to_string().contains("1045"));
    }
}
