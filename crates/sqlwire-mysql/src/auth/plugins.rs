//! Built-in authentication plugins.

use std::path::{Path, PathBuf};

use rsa::RsaPublicKey;
use sqlwire_core::Result;
use sqlwire_core::error::{AuthenticationError, AuthenticationErrorKind};

use super::scramble::{self, trim_seed};
use super::{AuthContext, AuthPlugin, AuthStep, names};

/// Server answers for `caching_sha2_password` more-data packets.
pub mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Byte `sha256_password` sends to ask for the server's public key.
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

fn plugin_error(plugin: &str, kind: AuthenticationErrorKind, message: impl Into<String>) -> AuthenticationError {
    AuthenticationError::new(kind, message).with_plugin(plugin)
}

fn password_with_nul(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// `mysql_native_password`: single SHA-1 challenge/response.
#[derive(Debug, Default)]
pub struct NativePassword;

impl NativePassword {
    pub fn boxed() -> Box<dyn AuthPlugin> {
        Box::new(Self)
    }
}

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        names::MYSQL_NATIVE_PASSWORD
    }

    fn start(&mut self, seed: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(scramble::native_password(ctx.password().unwrap_or(""), seed))
    }

    fn next(&mut self, _data: &[u8], _ctx: &AuthContext<'_>) -> Result<AuthStep> {
        Err(plugin_error(
            self.name(),
            AuthenticationErrorKind::PluginFailure,
            "unexpected extra authentication data",
        )
        .into())
    }

    fn reset(&mut self) {}
}

/// `mysql_clear_password`: the password itself, only over an encrypted channel.
#[derive(Debug, Default)]
pub struct ClearPassword;

impl ClearPassword {
    pub fn boxed() -> Box<dyn AuthPlugin> {
        Box::new(Self)
    }
}

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        names::MYSQL_CLEAR_PASSWORD
    }

    fn requires_confidentiality(&self) -> bool {
        true
    }

    fn start(&mut self, _seed: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if !ctx.encrypted {
            return Err(plugin_error(
                self.name(),
                AuthenticationErrorKind::RequiresConfidentiality,
                "mysql_clear_password requires an encrypted connection",
            )
            .into());
        }
        Ok(password_with_nul(ctx.password.unwrap_or("")))
    }

    fn next(&mut self, _data: &[u8], _ctx: &AuthContext<'_>) -> Result<AuthStep> {
        Err(plugin_error(
            self.name(),
            AuthenticationErrorKind::PluginFailure,
            "unexpected extra authentication data",
        )
        .into())
    }

    fn reset(&mut self) {}
}

/// RSA key handling shared by the SHA-256 plugins.
///
/// A key read from `server_rsa_public_key_file` is cached for the life of the
/// plugin; a key fetched from the server is scoped to one attempt.
#[derive(Debug, Default)]
struct RsaKeyState {
    file_key: Option<(PathBuf, RsaPublicKey)>,
    public_key_requested: bool,
}

impl RsaKeyState {
    fn configured_key(&mut self, plugin: &str, path: &Path) -> Result<&RsaPublicKey> {
        let cached = matches!(&self.file_key, Some((cached, _)) if cached == path);
        if !cached {
            let pem = std::fs::read(path).map_err(|e| {
                let mut err = plugin_error(
                    plugin,
                    AuthenticationErrorKind::MalformedKey,
                    format!("cannot read server public key '{}': {e}", path.display()),
                );
                err.source = Some(Box::new(e));
                err
            })?;
            let key = scramble::parse_public_key(&pem)?;
            tracing::debug!(path = %path.display(), "loaded server RSA public key");
            self.file_key = Some((path.to_path_buf(), key));
        }
        match &self.file_key {
            Some((_, key)) => Ok(key),
            None => Err(plugin_error(
                plugin,
                AuthenticationErrorKind::MalformedKey,
                "server public key unavailable",
            )
            .into()),
        }
    }

    /// Record a key request, refusing a second one within the same attempt.
    fn request(&mut self, plugin: &str, ctx: &AuthContext<'_>) -> Result<()> {
        if !ctx.options.allow_public_key_retrieval {
            return Err(plugin_error(
                plugin,
                AuthenticationErrorKind::PublicKeyRetrievalNotAllowed,
                "public key retrieval is not allowed",
            )
            .into());
        }
        if self.public_key_requested {
            return Err(plugin_error(
                plugin,
                AuthenticationErrorKind::PluginFailure,
                "server public key already requested in this attempt",
            )
            .into());
        }
        self.public_key_requested = true;
        tracing::debug!(plugin, "requesting server RSA public key");
        Ok(())
    }

    /// Answer to the full-authentication step: plaintext over TLS, RSA otherwise.
    /// `None` means the key must first be requested.
    fn full_auth(
        &mut self,
        plugin: &str,
        seed: &[u8],
        password: &str,
        ctx: &AuthContext<'_>,
    ) -> Result<Option<Vec<u8>>> {
        if ctx.encrypted {
            return Ok(Some(password_with_nul(password)));
        }
        if let Some(path) = &ctx.options.server_rsa_public_key_file {
            let key = self.configured_key(plugin, path)?;
            return scramble::encrypt_password(password, seed, key).map(Some);
        }
        Ok(None)
    }

    /// Encrypt with the key the server just sent.
    fn with_server_key(&self, plugin: &str, seed: &[u8], password: &str, pem: &[u8]) -> Result<Vec<u8>> {
        if !self.public_key_requested {
            return Err(plugin_error(
                plugin,
                AuthenticationErrorKind::PluginFailure,
                "server sent a public key that was not requested",
            )
            .into());
        }
        let key = scramble::parse_public_key(pem)?;
        scramble::encrypt_password(password, seed, &key)
    }
}

/// `sha256_password`: plaintext over TLS, RSA-encrypted otherwise.
#[derive(Debug, Default)]
pub struct Sha256Password {
    seed: Vec<u8>,
    keys: RsaKeyState,
}

impl Sha256Password {
    pub fn boxed() -> Box<dyn AuthPlugin> {
        Box::new(Self::default())
    }

    /// Whether this attempt already asked the server for its key.
    pub fn public_key_requested(&self) -> bool {
        self.keys.public_key_requested
    }
}

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &'static str {
        names::SHA256_PASSWORD
    }

    fn start(&mut self, seed: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        self.seed = trim_seed(seed).to_vec();
        let Some(password) = ctx.password() else {
            return Ok(vec![0]);
        };
        if let Some(response) = self.keys.full_auth(names::SHA256_PASSWORD, &self.seed, password, ctx)? {
            return Ok(response);
        }
        self.keys.request(names::SHA256_PASSWORD, ctx)?;
        Ok(vec![SHA256_REQUEST_PUBLIC_KEY])
    }

    fn next(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthStep> {
        let password = ctx.password().unwrap_or("");
        self.keys
            .with_server_key(names::SHA256_PASSWORD, &self.seed, password, data)
            .map(AuthStep::Respond)
    }

    fn reset(&mut self) {
        self.seed.clear();
        self.keys.public_key_requested = false;
    }
}

/// `caching_sha2_password`: SHA-256 fast path, falling back to full authentication.
#[derive(Debug, Default)]
pub struct CachingSha2Password {
    seed: Vec<u8>,
    keys: RsaKeyState,
}

impl CachingSha2Password {
    pub fn boxed() -> Box<dyn AuthPlugin> {
        Box::new(Self::default())
    }
}

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        names::CACHING_SHA2_PASSWORD
    }

    fn start(&mut self, seed: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        self.seed = trim_seed(seed).to_vec();
        Ok(scramble::caching_sha2_password(
            ctx.password().unwrap_or(""),
            &self.seed,
        ))
    }

    fn next(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthStep> {
        let password = ctx.password().unwrap_or("");
        if self.keys.public_key_requested {
            return self
                .keys
                .with_server_key(names::CACHING_SHA2_PASSWORD, &self.seed, password, data)
                .map(AuthStep::Respond);
        }
        match data {
            [caching_sha2::FAST_AUTH_SUCCESS] => {
                tracing::trace!("caching_sha2_password fast auth succeeded");
                Ok(AuthStep::Wait)
            }
            [caching_sha2::PERFORM_FULL_AUTH] => {
                tracing::debug!(encrypted = ctx.encrypted, "caching_sha2_password full auth");
                if let Some(response) = self.keys.full_auth(names::CACHING_SHA2_PASSWORD, &self.seed, password, ctx)? {
                    return Ok(AuthStep::Respond(response));
                }
                self.keys.request(names::CACHING_SHA2_PASSWORD, ctx)?;
                Ok(AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
            }
            _ => Err(plugin_error(
                self.name(),
                AuthenticationErrorKind::PluginFailure,
                format!("unexpected caching_sha2_password status {data:02x?}"),
            )
            .into()),
        }
    }

    fn reset(&mut self) {
        self.seed.clear();
        self.keys.public_key_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthOptions;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    fn ctx<'a>(password: Option<&'a str>, encrypted: bool, options: &'a AuthOptions) -> AuthContext<'a> {
        AuthContext {
            user: "app",
            password,
            encrypted,
            options,
        }
    }

    fn key_pair() -> (RsaPrivateKey, String) {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, pem)
    }

    #[test]
    fn test_clear_password_refuses_plaintext() {
        let options = AuthOptions::default();
        let mut plugin = ClearPassword;
        let err = plugin
            .start(b"seed", &ctx(Some("pw"), false, &options))
            .unwrap_err();
        assert_eq!(
            err.auth_kind(),
            Some(AuthenticationErrorKind::RequiresConfidentiality)
        );
        let ok = plugin.start(b"seed", &ctx(Some("pw"), true, &options)).unwrap();
        assert_eq!(ok, b"pw\0");
    }

    #[test]
    fn test_sha256_without_password_sends_zero() {
        let options = AuthOptions::default();
        let mut plugin = Sha256Password::default();
        assert_eq!(plugin.start(&[1; 20], &ctx(None, false, &options)).unwrap(), vec![0]);
        assert_eq!(plugin.start(&[1; 20], &ctx(Some(""), false, &options)).unwrap(), vec![0]);
    }

    #[test]
    fn test_sha256_over_tls_sends_plaintext() {
        let options = AuthOptions::default();
        let mut plugin = Sha256Password::default();
        let out = plugin.start(&[9; 20], &ctx(Some("pw"), true, &options)).unwrap();
        assert_eq!(out, b"pw\0");
    }

    #[test]
    fn test_sha256_refuses_key_retrieval_when_disabled() {
        let options = AuthOptions::default();
        let mut plugin = Sha256Password::default();
        let err = plugin
            .start(&[9; 20], &ctx(Some("pw"), false, &options))
            .unwrap_err();
        assert_eq!(
            err.auth_kind(),
            Some(AuthenticationErrorKind::PublicKeyRetrievalNotAllowed)
        );
        assert!(!plugin.public_key_requested());
    }

    #[test]
    fn test_sha256_requests_key_once_then_encrypts() {
        use rsa::Oaep;
        use sha1::Sha1;

        let (private, pem) = key_pair();
        let options = AuthOptions {
            allow_public_key_retrieval: true,
            ..AuthOptions::default()
        };
        let seed = b"abcdefghijklmnopqrst";
        let c = ctx(Some("hunter2"), false, &options);
        let mut plugin = Sha256Password::default();

        assert_eq!(plugin.start(seed, &c).unwrap(), vec![SHA256_REQUEST_PUBLIC_KEY]);
        assert!(plugin.public_key_requested());

        let AuthStep::Respond(encrypted) = plugin.next(pem.as_bytes(), &c).unwrap() else {
            panic!("expected a response");
        };
        let decrypted = private.decrypt(Oaep::new::<Sha1>(), &encrypted).unwrap();
        assert_eq!(decrypted, scramble::xor_with_seed("hunter2", seed));

        // a second request in the same attempt is refused
        let err = plugin.keys.request(names::SHA256_PASSWORD, &c).unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthenticationErrorKind::PluginFailure));

        plugin.reset();
        assert!(!plugin.public_key_requested());
    }

    #[test]
    fn test_sha256_uses_configured_key_file() {
        use rsa::Oaep;
        use sha1::Sha1;

        let (private, pem) = key_pair();
        let path = std::env::temp_dir().join(format!("sqlwire-key-{}.pem", std::process::id()));
        std::fs::write(&path, pem).unwrap();
        let options = AuthOptions {
            server_rsa_public_key_file: Some(path.clone()),
            allow_public_key_retrieval: false,
        };
        let seed = [0x5Au8; 20];
        let mut plugin = Sha256Password::default();
        let encrypted = plugin.start(&seed, &ctx(Some("pw"), false, &options)).unwrap();
        std::fs::remove_file(&path).unwrap();

        let decrypted = private.decrypt(Oaep::new::<Sha1>(), &encrypted).unwrap();
        assert_eq!(decrypted, scramble::xor_with_seed("pw", &seed));

        // the key stays cached after the file is gone
        plugin.reset();
        assert!(plugin.start(&seed, &ctx(Some("pw"), false, &options)).is_ok());
    }

    #[test]
    fn test_missing_key_file_is_malformed_key() {
        let options = AuthOptions {
            server_rsa_public_key_file: Some(PathBuf::from("/nonexistent/sqlwire/key.pem")),
            allow_public_key_retrieval: true,
        };
        let mut plugin = Sha256Password::default();
        let err = plugin
            .start(&[1; 20], &ctx(Some("pw"), false, &options))
            .unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthenticationErrorKind::MalformedKey));
    }

    #[test]
    fn test_caching_sha2_fast_and_full_paths() {
        let options = AuthOptions::default();
        let mut plugin = CachingSha2Password::default();
        let plain = ctx(Some("pw"), false, &options);
        assert_eq!(plugin.start(&[3; 20], &plain).unwrap().len(), 32);
        assert_eq!(
            plugin.next(&[caching_sha2::FAST_AUTH_SUCCESS], &plain).unwrap(),
            AuthStep::Wait
        );

        let tls = ctx(Some("pw"), true, &options);
        assert_eq!(
            plugin.next(&[caching_sha2::PERFORM_FULL_AUTH], &tls).unwrap(),
            AuthStep::Respond(b"pw\0".to_vec())
        );

        let err = plugin
            .next(&[caching_sha2::PERFORM_FULL_AUTH], &plain)
            .unwrap_err();
        assert_eq!(
            err.auth_kind(),
            Some(AuthenticationErrorKind::PublicKeyRetrievalNotAllowed)
        );
    }

    #[test]
    fn test_caching_sha2_requests_key_with_0x02() {
        let options = AuthOptions {
            allow_public_key_retrieval: true,
            ..AuthOptions::default()
        };
        let c = ctx(Some("pw"), false, &options);
        let mut plugin = CachingSha2Password::default();
        plugin.start(&[3; 20], &c).unwrap();
        assert_eq!(
            plugin.next(&[caching_sha2::PERFORM_FULL_AUTH], &c).unwrap(),
            AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY])
        );
        let (_private, pem) = key_pair();
        assert!(matches!(
            plugin.next(pem.as_bytes(), &c).unwrap(),
            AuthStep::Respond(bytes) if bytes.len() == 128
        ));
    }
}
