//! TLS upgrade of a session channel.
//!
//! The upgrade happens inside the handshake:
//!
//! 1. Server greeting advertises `CLIENT_SSL`
//! 2. Client sends the short SSL request (caps, max packet, charset, 23 zeros)
//! 3. Client performs the TLS handshake on the same socket
//! 4. Credentials are sent over the encrypted channel
//!
//! The handshake only depends on the [`TlsUpgrader`] trait. With the `tls`
//! feature, [`RustlsUpgrader`] provides the rustls implementation.

use std::path::PathBuf;

use sqlwire_core::error::{TransportError, TransportErrorKind};
use sqlwire_core::{Error, Result};

use crate::protocol::{PacketWriter, capabilities};
use crate::transport::Channel;

/// SSL mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never use TLS
    #[default]
    Disable,
    /// Use TLS when the server supports it
    Preferred,
    /// Require TLS
    Required,
    /// Require TLS and verify the server certificate chain
    VerifyCa,
    /// Require TLS, verify the chain and the host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }

    /// Parse the `sslMode` / `ssl-mode` URL option value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "disable" | "disabled" => Some(SslMode::Disable),
            "preferred" => Some(SslMode::Preferred),
            "required" => Some(SslMode::Required),
            "verify_ca" => Some(SslMode::VerifyCa),
            "verify_identity" => Some(SslMode::VerifyIdentity),
            _ => None,
        }
    }
}

/// Certificates and verification options for the TLS upgrade.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM file with the CA certificate(s) to trust
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// PEM private key matching `client_cert_path`
    pub client_key_path: Option<PathBuf>,
    /// SNI / verification name, when it differs from the connect host
    pub server_name: Option<String>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(cert.into());
        self.client_key_path = Some(key.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn danger_skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// Turns a plaintext channel into an encrypted one.
pub trait TlsUpgrader: Send + Sync {
    fn upgrade(&self, channel: Box<dyn Channel>, server_name: &str) -> Result<Box<dyn Channel>>;
}

/// Build the SSL request payload sent right before the TLS handshake.
pub fn build_ssl_request(client_caps: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
    writer.into_bytes()
}

/// Decide whether to upgrade, given the mode and the server's capabilities.
pub fn should_upgrade(ssl_mode: SslMode, server_caps: u32) -> Result<bool> {
    let server_supports = server_caps & capabilities::CLIENT_SSL != 0;
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports),
        _ if server_supports => Ok(true),
        _ => Err(tls_error("TLS required but the server does not support it")),
    }
}

/// Check that the certificate options are coherent for `ssl_mode`.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<()> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be configured together",
        ));
    }
    if matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity)
        && tls_config.danger_skip_verify
    {
        return Err(tls_error(format!(
            "{ssl_mode:?} cannot be combined with danger_skip_verify"
        )));
    }
    Ok(())
}

pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::Transport(TransportError::new(TransportErrorKind::Tls, message))
}

/// Build the upgrader used by `MySqlSession::connect`.
#[cfg(feature = "tls")]
pub fn default_upgrader(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<Box<dyn TlsUpgrader>> {
    Ok(Box::new(RustlsUpgrader::new(ssl_mode, tls_config)?))
}

/// Without the `tls` feature no upgrade is possible.
#[cfg(not(feature = "tls"))]
pub fn default_upgrader(
    _ssl_mode: SslMode,
    _tls_config: &TlsConfig,
) -> Result<Box<dyn TlsUpgrader>> {
    Err(tls_error(
        "TLS support requires the `tls` feature of sqlwire-mysql",
    ))
}

#[cfg(feature = "tls")]
pub use rustls_impl::RustlsUpgrader;

#[cfg(feature = "tls")]
mod rustls_impl {
    use std::fs::File;
    use std::io::{self, BufReader, Read, Write};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use sqlwire_core::Result;

    use super::{SslMode, TlsConfig, TlsUpgrader, tls_error};
    use crate::transport::{Channel, ChannelShutdown};

    /// rustls-backed upgrader.
    #[derive(Debug, Clone)]
    pub struct RustlsUpgrader {
        config: Arc<rustls::ClientConfig>,
        server_name: Option<String>,
    }

    impl RustlsUpgrader {
        pub fn new(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<Self> {
            super::validate_tls_config(ssl_mode, tls_config)?;
            Ok(Self {
                config: Arc::new(build_client_config(tls_config)?),
                server_name: tls_config.server_name.clone(),
            })
        }
    }

    impl TlsUpgrader for RustlsUpgrader {
        fn upgrade(&self, mut sock: Box<dyn Channel>, server_name: &str) -> Result<Box<dyn Channel>> {
            let sni = self.server_name.as_deref().unwrap_or(server_name);
            let name = rustls::pki_types::ServerName::try_from(sni.to_string())
                .map_err(|e| tls_error(format!("invalid server name '{sni}': {e}")))?;
            let mut conn = rustls::ClientConnection::new(self.config.clone(), name)
                .map_err(|e| tls_error(format!("failed to create TLS session: {e}")))?;

            while conn.is_handshaking() {
                conn.complete_io(&mut sock)
                    .map_err(|e| tls_error(format!("TLS handshake failed: {e}")))?;
            }
            tracing::debug!(
                version = ?conn.protocol_version(),
                suite = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
                "TLS established"
            );
            Ok(Box::new(TlsChannel { conn, sock }))
        }
    }

    struct TlsChannel {
        conn: rustls::ClientConnection,
        sock: Box<dyn Channel>,
    }

    impl Read for TlsChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                match self.conn.reader().read(buf) {
                    Ok(n) if n > 0 => return Ok(n),
                    Ok(_) => return Ok(0),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                if self.conn.read_tls(&mut self.sock)? == 0 {
                    return Ok(0);
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::other(format!("TLS error: {e}")))?;
            }
        }
    }

    impl Write for TlsChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.conn.writer().write(buf)?;
            while self.conn.wants_write() {
                self.conn.write_tls(&mut self.sock)?;
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.conn.writer().flush()?;
            while self.conn.wants_write() {
                self.conn.write_tls(&mut self.sock)?;
            }
            self.sock.flush()
        }
    }

    impl Channel for TlsChannel {
        fn is_encrypted(&self) -> bool {
            true
        }

        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
            self.sock.set_read_timeout(timeout)
        }

        fn shutdown_handle(&self) -> Option<Box<dyn ChannelShutdown>> {
            self.sock.shutdown_handle()
        }
    }

    fn build_client_config(tls_config: &TlsConfig) -> Result<rustls::ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?;

        if tls_config.danger_skip_verify {
            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth());
        }

        let mut roots = rustls::RootCertStore::empty();
        match &tls_config.ca_cert_path {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        let builder = builder.with_root_certificates(roots);

        match (&tls_config.client_cert_path, &tls_config.client_key_path) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let mut reader = BufReader::new(open(key)?);
                let key = rustls_pemfile::private_key(&mut reader)
                    .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
                    .ok_or_else(|| tls_error(format!("no private key in '{}'", key.display())))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| tls_error(format!("failed to configure client auth: {e}")))
            }
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    fn open(path: &Path) -> Result<File> {
        File::open(path).map_err(|e| tls_error(format!("failed to open '{}': {e}", path.display())))
    }

    fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
        let mut reader = BufReader::new(open(path)?);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| tls_error(format!("failed to parse '{}': {e}", path.display())))?;
        if certs.is_empty() {
            return Err(tls_error(format!(
                "no certificates found in '{}'",
                path.display()
            )));
        }
        Ok(certs)
    }

    /// Accepts any server certificate.
    #[derive(Debug)]
    struct NoVerifier;

    impl rustls::client::danger::ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            use rustls::SignatureScheme::{
                ECDSA_NISTP256_SHA256, ECDSA_NISTP384_SHA384, ED25519, RSA_PKCS1_SHA256,
                RSA_PKCS1_SHA384, RSA_PSS_SHA256, RSA_PSS_SHA384,
            };
            vec![
                RSA_PKCS1_SHA256,
                RSA_PKCS1_SHA384,
                ECDSA_NISTP256_SHA256,
                ECDSA_NISTP384_SHA384,
                RSA_PSS_SHA256,
                RSA_PSS_SHA384,
                ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_request_layout() {
        let payload = build_ssl_request(capabilities::CLIENT_PROTOCOL_41, 1 << 24, 45);
        assert_eq!(payload.len(), 32);
        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_ne!(caps & capabilities::CLIENT_SSL, 0);
        assert_eq!(payload[8], 45);
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_should_upgrade() {
        let ssl = capabilities::CLIENT_SSL;
        assert!(!should_upgrade(SslMode::Disable, ssl).unwrap());
        assert!(should_upgrade(SslMode::Preferred, ssl).unwrap());
        assert!(!should_upgrade(SslMode::Preferred, 0).unwrap());
        assert!(should_upgrade(SslMode::Required, ssl).unwrap());
        let err = should_upgrade(SslMode::VerifyIdentity, 0).unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::Tls));
    }

    #[test]
    fn test_validate_tls_config() {
        assert!(validate_tls_config(SslMode::Required, &TlsConfig::new()).is_ok());
        let half = TlsConfig {
            client_cert_path: Some("client.pem".into()),
            ..TlsConfig::default()
        };
        assert!(validate_tls_config(SslMode::Required, &half).is_err());
        let skip = TlsConfig::new().danger_skip_verify(true);
        assert!(validate_tls_config(SslMode::Required, &skip).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &skip).is_err());
    }

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!(SslMode::parse("VERIFY_IDENTITY"), Some(SslMode::VerifyIdentity));
        assert_eq!(SslMode::parse("verify-ca"), Some(SslMode::VerifyCa));
        assert_eq!(SslMode::parse("sometimes"), None);
    }
}
