//! Session-management traits shared by the protocol engine and the pool.
//!
//! The pool never knows about packets: it manages values implementing
//! [`ManagedSession`], created on demand by a [`SessionFactory`].

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Credentials a session authenticates as.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub user: String,
    pub password: Option<String>,
}

impl Account {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    /// Identity used to match pooled sessions to this account.
    pub fn key(&self) -> AccountKey {
        AccountKey::new(&self.user, self.password.as_deref())
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// User name plus a SHA-256 digest of the password.
///
/// Equality is exact on both parts: `("u", None)`, `("u", Some("p"))` and
/// `("u", Some("p2"))` are three distinct keys.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccountKey {
    user: String,
    password_digest: Option<[u8; 32]>,
}

impl AccountKey {
    pub fn new(user: &str, password: Option<&str>) -> Self {
        let password_digest = password.map(|p| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&Sha256::digest(p.as_bytes()));
            out
        });
        Self {
            user: user.to_string(),
            password_digest,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn has_password(&self) -> bool {
        self.password_digest.is_some()
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("user", &self.user)
            .field("has_password", &self.has_password())
            .finish()
    }
}

/// Global (distributed) transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub gtrid: Vec<u8>,
    pub bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            gtrid: gtrid.into(),
            bqual: bqual.into(),
        }
    }

    /// Render as the argument list of an `XA ...` statement: `X'..',X'..',n`.
    pub fn to_sql(&self) -> String {
        format!(
            "X'{}',X'{}',{}",
            hex(&self.gtrid),
            hex(&self.bqual),
            self.format_id
        )
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

fn hex(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// A physical session the pool can park, enlist and reap.
///
/// Implementations are used by one worker at a time; the pool moves them
/// between threads but never shares them.
pub trait ManagedSession: Send {
    /// `XA START`
    fn xa_start(&mut self, xid: &Xid) -> Result<()>;

    /// `XA END`
    fn xa_end(&mut self, xid: &Xid) -> Result<()>;

    /// `XA PREPARE`
    fn xa_prepare(&mut self, xid: &Xid) -> Result<()>;

    /// `XA COMMIT`, optionally one-phase.
    fn xa_commit(&mut self, xid: &Xid, one_phase: bool) -> Result<()>;

    /// `XA ROLLBACK`
    fn xa_rollback(&mut self, xid: &Xid) -> Result<()>;

    /// Cheap liveness probe.
    fn is_alive(&mut self) -> bool;

    /// Close the session. Must be idempotent.
    fn close(&mut self);
}

/// Creates authenticated sessions on demand.
pub trait SessionFactory: Send + Sync {
    type Session: ManagedSession;

    fn create(&self, account: &Account) -> Result<Self::Session>;
}
