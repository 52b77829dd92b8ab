//! Connection handshake and authentication exchange.
//!
//! ```text
//! AwaitingGreeting -> CapabilitiesSent -> PluginExchange(n) -> Authenticated
//!                                                           \-> Rejected
//! ```
//!
//! The exchange loop never assumes a fixed number of round trips: each server
//! packet is classified by its first byte (`0x00` OK, `0xFF` ERR, `0xFE` auth
//! switch, `0x01` more data) until the server accepts or rejects the attempt.

use std::collections::HashMap;

use sqlwire_core::Result;
use sqlwire_core::error::{AuthenticationError, AuthenticationErrorKind, ProtocolError};

use crate::auth::{AuthContext, AuthOptions, AuthPlugin, AuthStep, PluginRegistry, names};
use crate::config::MySqlConfig;
use crate::protocol::{Command, OkPacket, PacketReader, PacketWriter, capabilities};
use crate::tls::{TlsUpgrader, build_ssl_request, should_upgrade, tls_error};
use crate::transport::PacketTransport;

/// Upper bound on server packets read during one authentication attempt.
pub const MAX_AUTH_ROUNDS: u8 = 16;

/// Plugin assumed when the server predates pluggable auth.
pub const LEGACY_PLUGIN: &str = names::MYSQL_NATIVE_PASSWORD;

/// The only handshake protocol version spoken here.
pub const PROTOCOL_VERSION: u8 = 10;

/// Where the handshake currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingGreeting,
    CapabilitiesSent,
    /// Reading the n-th server packet of the plugin exchange
    PluginExchange(u8),
    Authenticated,
    Rejected,
}

/// Initial handshake packet (protocol 10).
#[derive(Debug, Clone)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble parts 1 and 2, without the trailing NUL
    pub seed: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Empty when the server does not speak `CLIENT_PLUGIN_AUTH`
    pub auth_plugin: String,
}

impl Greeting {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let malformed = |what: &str| ProtocolError {
            message: format!("malformed handshake: missing {what}"),
            raw_data: Some(payload.to_vec()),
        };

        let protocol_version = reader.read_u8().ok_or_else(|| malformed("protocol version"))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError {
                message: format!("unsupported handshake protocol version {protocol_version}"),
                raw_data: Some(payload.to_vec()),
            }
            .into());
        }
        let server_version = reader.read_null_string();
        let connection_id = reader.read_u32_le().ok_or_else(|| malformed("connection id"))?;
        let seed_1 = reader.read_bytes(8).ok_or_else(|| malformed("scramble"))?;
        reader.skip(1);
        let caps_lower = reader.read_u16_le().ok_or_else(|| malformed("capability flags"))?;

        let mut greeting = Greeting {
            protocol_version,
            server_version,
            connection_id,
            seed: seed_1.to_vec(),
            capabilities: u32::from(caps_lower),
            charset: 0,
            status_flags: 0,
            auth_plugin: String::new(),
        };
        if reader.is_empty() {
            return Ok(greeting);
        }

        greeting.charset = reader.read_u8().ok_or_else(|| malformed("charset"))?;
        greeting.status_flags = reader.read_u16_le().ok_or_else(|| malformed("status flags"))?;
        let caps_upper = reader.read_u16_le().ok_or_else(|| malformed("capability flags"))?;
        greeting.capabilities |= u32::from(caps_upper) << 16;

        let seed_len = usize::from(reader.read_u8().ok_or_else(|| malformed("scramble length"))?);
        reader.skip(10);

        if greeting.capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            // Part 2 is max(13, len - 8) bytes including a trailing NUL.
            let len = seed_len.saturating_sub(8).max(13);
            let seed_2 = reader
                .read_bytes(len.min(reader.remaining()))
                .ok_or_else(|| malformed("scramble"))?;
            let seed_2 = seed_2.strip_suffix(&[0]).unwrap_or(seed_2);
            greeting.seed.extend_from_slice(seed_2);
        }
        if greeting.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            greeting.auth_plugin = reader.read_null_string();
        }
        Ok(greeting)
    }
}

/// What a successful connect negotiated.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub greeting: Greeting,
    /// Client flags ∩ server flags, plus `CLIENT_SSL` if the upgrade happened
    pub capabilities: u32,
    /// Plugin that completed authentication
    pub plugin: String,
    pub ok: OkPacket,
}

/// Login data for one authentication attempt.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: Option<&'a str>,
    pub database: Option<&'a str>,
}

/// Drives one handshake or change-user over a transport.
pub struct Handshake<'a> {
    transport: &'a mut PacketTransport,
    registry: &'a PluginRegistry,
    options: &'a AuthOptions,
    state: HandshakeState,
}

impl std::fmt::Debug for Handshake<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'a> Handshake<'a> {
    pub fn new(
        transport: &'a mut PacketTransport,
        registry: &'a PluginRegistry,
        options: &'a AuthOptions,
    ) -> Self {
        Self {
            transport,
            registry,
            options,
            state: HandshakeState::AwaitingGreeting,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Full connection handshake: greeting, optional TLS upgrade,
    /// handshake response and plugin exchange.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %config.user))]
    pub fn connect(
        &mut self,
        config: &MySqlConfig,
        upgrader: Option<&dyn TlsUpgrader>,
    ) -> Result<Negotiated> {
        let result = self.run_connect(config, upgrader);
        if result.is_err() {
            self.state = HandshakeState::Rejected;
        }
        result
    }

    /// Re-authenticate as another user on the same transport (`COM_CHANGE_USER`).
    #[tracing::instrument(level = "debug", skip_all, fields(user = %creds.user))]
    pub fn change_user(
        &mut self,
        negotiated: &Negotiated,
        config: &MySqlConfig,
        creds: Credentials<'_>,
    ) -> Result<OkPacket> {
        self.state = HandshakeState::CapabilitiesSent;
        let result = self.run_change_user(negotiated, config, creds);
        if result.is_err() {
            self.state = HandshakeState::Rejected;
        }
        result
    }

    fn run_connect(
        &mut self,
        config: &MySqlConfig,
        upgrader: Option<&dyn TlsUpgrader>,
    ) -> Result<Negotiated> {
        self.state = HandshakeState::AwaitingGreeting;
        self.transport.reset_sequence();
        let payload = self.transport.read_packet()?;
        if payload.first() == Some(&0xFF) {
            let err = PacketReader::new(&payload).parse_err_packet().ok_or_else(|| {
                ProtocolError {
                    message: "malformed error packet in place of handshake".to_string(),
                    raw_data: Some(payload.clone()),
                }
            })?;
            return Err(err.into_server_error().into());
        }
        let greeting = Greeting::parse(&payload)?;
        tracing::debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            plugin = %greeting.auth_plugin,
            "received server greeting"
        );

        let mut caps = config.capability_flags() & greeting.capabilities;
        if caps & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(ProtocolError {
                message: "server does not support protocol 4.1".to_string(),
                raw_data: None,
            }
            .into());
        }

        match (should_upgrade(config.ssl_mode, greeting.capabilities)?, upgrader) {
            (true, Some(upgrader)) => {
                caps |= capabilities::CLIENT_SSL;
                self.transport.write_packet(&build_ssl_request(
                    caps,
                    config.max_packet_size,
                    config.charset,
                ))?;
                self.transport.upgrade(upgrader, config.tls_server_name())?;
            }
            (true, None) if config.ssl_mode.is_required() => {
                return Err(tls_error("TLS required but no TLS upgrader is available"));
            }
            (true, None) => {
                tracing::debug!("TLS preferred but no upgrader available; staying in plaintext");
            }
            (false, _) => {}
        }

        let plugin_name = self.initial_plugin(&greeting);
        let mut plugin = self.registry.create(&plugin_name)?;
        let creds = Credentials {
            user: &config.user,
            password: config.password.as_deref(),
            database: config.database.as_deref(),
        };
        let auth_response = self.start_plugin(plugin.as_mut(), &greeting.seed, creds)?;

        let response = build_handshake_response(&HandshakeResponse {
            capabilities: caps,
            max_packet_size: config.max_packet_size,
            charset: config.charset,
            user: creds.user,
            auth_response: &auth_response,
            database: creds.database,
            plugin: plugin.name(),
            attributes: &config.attributes,
        })?;
        self.transport.write_packet(&response)?;
        self.state = HandshakeState::CapabilitiesSent;

        let (plugin, ok) = self.exchange(plugin, creds, caps)?;
        if caps & capabilities::CLIENT_COMPRESS != 0 {
            self.transport.enable_compression();
        }
        Ok(Negotiated {
            greeting,
            capabilities: caps,
            plugin,
            ok,
        })
    }

    fn run_change_user(
        &mut self,
        negotiated: &Negotiated,
        config: &MySqlConfig,
        creds: Credentials<'_>,
    ) -> Result<OkPacket> {
        let caps = negotiated.capabilities;
        let mut plugin = self.registry.create(&negotiated.plugin)?;
        let auth_response = self.start_plugin(plugin.as_mut(), &negotiated.greeting.seed, creds)?;

        let mut writer = PacketWriter::command(Command::ChangeUser);
        writer.write_null_string(creds.user);
        write_auth_response(&mut writer, caps & !LENENC_AUTH, &auth_response, plugin.name())?;
        writer.write_null_string(creds.database.unwrap_or(""));
        writer.write_u16_le(u16::from(config.charset));
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(plugin.name());
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            write_attributes(&mut writer, &config.attributes);
        }

        self.transport.reset_sequence();
        self.transport.write_packet(writer.as_bytes())?;
        let (_, ok) = self.exchange(plugin, creds, caps)?;
        Ok(ok)
    }

    /// The server's preferred plugin if it is enabled here, else the configured default.
    fn initial_plugin(&self, greeting: &Greeting) -> String {
        if greeting.capabilities & capabilities::CLIENT_PLUGIN_AUTH == 0
            && self.registry.contains(LEGACY_PLUGIN)
        {
            return LEGACY_PLUGIN.to_string();
        }
        if !greeting.auth_plugin.is_empty() && self.registry.contains(&greeting.auth_plugin) {
            greeting.auth_plugin.clone()
        } else {
            self.registry.default_plugin().to_string()
        }
    }

    fn context<'c>(&self, creds: Credentials<'c>) -> AuthContext<'c>
    where
        'a: 'c,
    {
        AuthContext {
            user: creds.user,
            password: creds.password,
            encrypted: self.transport.is_encrypted(),
            options: self.options,
        }
    }

    /// Refuse plaintext for confidential plugins, then compute the first response.
    fn start_plugin(
        &self,
        plugin: &mut dyn AuthPlugin,
        seed: &[u8],
        creds: Credentials<'_>,
    ) -> Result<Vec<u8>> {
        if plugin.requires_confidentiality() && !self.transport.is_encrypted() {
            return Err(AuthenticationError::new(
                AuthenticationErrorKind::RequiresConfidentiality,
                format!("{} requires an encrypted connection", plugin.name()),
            )
            .with_plugin(plugin.name())
            .into());
        }
        plugin.start(seed, &self.context(creds))
    }

    fn exchange(
        &mut self,
        mut plugin: Box<dyn AuthPlugin>,
        creds: Credentials<'_>,
        caps: u32,
    ) -> Result<(String, OkPacket)> {
        for round in 0..MAX_AUTH_ROUNDS {
            self.state = HandshakeState::PluginExchange(round);
            let packet = self.transport.read_packet()?;
            match packet.first().copied() {
                Some(0x00) => {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet(caps)
                        .ok_or_else(|| malformed_packet("OK", &packet))?;
                    plugin.reset();
                    self.state = HandshakeState::Authenticated;
                    tracing::debug!(plugin = plugin.name(), rounds = round + 1, "authenticated");
                    return Ok((plugin.name().to_string(), ok));
                }
                Some(0xFF) => {
                    plugin.reset();
                    let err = PacketReader::new(&packet)
                        .parse_err_packet()
                        .ok_or_else(|| malformed_packet("ERR", &packet))?;
                    tracing::debug!(code = err.error_code, "authentication rejected");
                    let mut auth = AuthenticationError::new(
                        AuthenticationErrorKind::Rejected,
                        err.error_message,
                    )
                    .with_plugin(plugin.name());
                    auth.server_code = Some(err.error_code);
                    return Err(auth.into());
                }
                Some(0xFE) => {
                    let mut reader = PacketReader::new(&packet[1..]);
                    let name = reader.read_null_string();
                    let seed = reader.read_rest();
                    let seed = seed.strip_suffix(&[0]).unwrap_or(seed);
                    tracing::debug!(from = plugin.name(), to = %name, "auth switch");
                    plugin.reset();
                    plugin = self.registry.create(&name)?;
                    let response = self.start_plugin(plugin.as_mut(), seed, creds)?;
                    self.transport.write_packet(&response)?;
                }
                Some(0x01) => match plugin.next(&packet[1..], &self.context(creds))? {
                    AuthStep::Respond(response) => self.transport.write_packet(&response)?,
                    AuthStep::Wait => {}
                },
                _ => return Err(malformed_packet("authentication", &packet).into()),
            }
        }
        plugin.reset();
        Err(AuthenticationError::new(
            AuthenticationErrorKind::PluginFailure,
            format!("authentication did not finish within {MAX_AUTH_ROUNDS} rounds"),
        )
        .with_plugin(plugin.name())
        .into())
    }
}

fn malformed_packet(what: &str, packet: &[u8]) -> ProtocolError {
    ProtocolError {
        message: format!("malformed {what} packet during authentication"),
        raw_data: Some(packet.to_vec()),
    }
}

/// Fields of the protocol 4.1 handshake response.
#[derive(Debug)]
pub struct HandshakeResponse<'r> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'r str,
    pub auth_response: &'r [u8],
    pub database: Option<&'r str>,
    pub plugin: &'r str,
    pub attributes: &'r HashMap<String, String>,
}

/// Serialize the handshake response for the negotiated capabilities.
///
/// Fails when the auth data does not fit the single length byte of a
/// `CLIENT_SECURE_CONNECTION` session without length-encoded auth data.
pub fn build_handshake_response(r: &HandshakeResponse<'_>) -> Result<Vec<u8>> {
    let caps = r.capabilities;
    let mut writer = PacketWriter::new();
    writer.write_u32_le(caps);
    writer.write_u32_le(r.max_packet_size);
    writer.write_u8(r.charset);
    writer.write_zeros(23);
    writer.write_null_string(r.user);

    write_auth_response(&mut writer, caps, r.auth_response, r.plugin)?;

    if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        writer.write_null_string(r.database.unwrap_or(""));
    }
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(r.plugin);
    }
    if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        write_attributes(&mut writer, r.attributes);
    }
    Ok(writer.into_bytes())
}

const LENENC_AUTH: u32 = capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

fn write_auth_response(
    writer: &mut PacketWriter,
    caps: u32,
    auth_response: &[u8],
    plugin: &str,
) -> Result<()> {
    if caps & LENENC_AUTH != 0 {
        writer.write_lenenc_bytes(auth_response);
    } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len = u8::try_from(auth_response.len()).map_err(|_| {
            AuthenticationError::new(
                AuthenticationErrorKind::PluginFailure,
                format!(
                    "auth response of {} bytes exceeds 255 without length-encoded auth data",
                    auth_response.len()
                ),
            )
            .with_plugin(plugin)
        })?;
        writer.write_u8(len);
        writer.write_bytes(auth_response);
    } else {
        writer.write_bytes(auth_response);
        writer.write_u8(0);
    }
    Ok(())
}

fn write_attributes(writer: &mut PacketWriter, attributes: &HashMap<String, String>) {
    let mut attrs = PacketWriter::new();
    let mut keys: Vec<_> = attributes.keys().collect();
    keys.sort();
    for key in keys {
        attrs.write_lenenc_string(key);
        attrs.write_lenenc_string(&attributes[key]);
    }
    writer.write_lenenc_bytes(attrs.as_bytes());
}
