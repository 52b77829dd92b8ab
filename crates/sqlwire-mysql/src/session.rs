//! A MySQL session: one authenticated transport plus its server state.

use std::net::{TcpStream, ToSocketAddrs};

use sqlwire_core::error::{TransportError, TransportErrorKind};
use sqlwire_core::{Account, Error, ManagedSession, ProtocolError, Result, SessionFactory, Xid};

use crate::auth::{AuthOptions, PluginRegistry};
use crate::config::MySqlConfig;
use crate::decode::ColumnDecoder;
use crate::handshake::{Credentials, Handshake, Negotiated};
use crate::interceptor::{InterceptorChain, QueryInterceptor};
use crate::protocol::{
    Command, MAX_PACKET_SIZE, OkPacket, PacketReader, PacketType, PacketWriter, capabilities,
};
use crate::row::Row;
use crate::state::{ServerSessionState, TransactionPhase};
use crate::tls::{SslMode, TlsUpgrader, default_upgrader};
use crate::transport::{Channel, CloseHandle, PacketTransport};
use crate::types::ColumnDefinition;

/// Outcome of one text-protocol statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Empty for statements without a result set
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
    /// Transaction phase after the statement
    pub phase: TransactionPhase,
}

impl QueryResult {
    fn from_ok(ok: &OkPacket, phase: TransactionPhase) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            info: ok.info.clone(),
            phase,
            ..Self::default()
        }
    }
}

/// An authenticated MySQL session.
pub struct MySqlSession {
    transport: PacketTransport,
    config: MySqlConfig,
    registry: PluginRegistry,
    auth_options: AuthOptions,
    negotiated: Negotiated,
    state: ServerSessionState,
    decoder: ColumnDecoder,
    interceptors: InterceptorChain,
}

impl std::fmt::Debug for MySqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSession")
            .field("connection_id", &self.connection_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .field("open", &self.transport.is_open())
            .finish_non_exhaustive()
    }
}

impl MySqlSession {
    /// Open a TCP connection and run the handshake.
    #[allow(clippy::result_large_err)]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        config.validate()?;
        let addrs = config.socket_addr().to_socket_addrs().map_err(|e| {
            Error::Transport(TransportError::from_io(
                &format!("resolve {}", config.socket_addr()),
                e,
            ))
        })?;

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) => {
                return Err(Error::Transport(TransportError::from_io(
                    &format!("connect to {}", config.socket_addr()),
                    e,
                )));
            }
            (None, None) => {
                return Err(Error::Transport(TransportError::new(
                    TransportErrorKind::ConnectionLost,
                    format!("{} resolved to no addresses", config.socket_addr()),
                )));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let upgrader = match config.ssl_mode {
            SslMode::Disable => None,
            mode if mode.is_required() => Some(default_upgrader(mode, &config.tls_config)?),
            mode => match default_upgrader(mode, &config.tls_config) {
                Ok(upgrader) => Some(upgrader),
                Err(e) => {
                    tracing::debug!(error = %e, "no TLS upgrader for preferred mode");
                    None
                }
            },
        };
        Self::from_channel(Box::new(stream), config, upgrader.as_deref())
    }

    /// Run the handshake over an already-open channel.
    #[allow(clippy::result_large_err)]
    pub fn from_channel(
        channel: Box<dyn Channel>,
        config: MySqlConfig,
        upgrader: Option<&dyn TlsUpgrader>,
    ) -> Result<Self> {
        let registry = config.plugin_registry()?;
        let auth_options = config.auth_options();
        let mut transport = PacketTransport::new(channel, config.socket_timeout)?;

        let negotiated = match Handshake::new(&mut transport, &registry, &auth_options)
            .connect(&config, upgrader)
        {
            Ok(negotiated) => negotiated,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        let mut state = ServerSessionState::new(
            negotiated.greeting.server_version.clone(),
            u16::from(config.charset),
            negotiated.greeting.status_flags,
        );
        state.apply_ok(&negotiated.ok)?;
        state.set_long_column_info(negotiated.capabilities & capabilities::CLIENT_LONG_FLAG != 0);
        if negotiated.capabilities & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            state.set_schema(config.database.clone());
        }

        tracing::debug!(
            connection_id = negotiated.greeting.connection_id,
            server_version = %negotiated.greeting.server_version,
            plugin = %negotiated.plugin,
            encrypted = transport.is_encrypted(),
            "session established"
        );

        Ok(Self {
            transport,
            decoder: ColumnDecoder::new(config.zero_date_behavior),
            config,
            registry,
            auth_options,
            negotiated,
            state,
            interceptors: InterceptorChain::new(),
        })
    }

    pub fn add_interceptor(&mut self, interceptor: Box<dyn QueryInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn connection_id(&self) -> u32 {
        self.negotiated.greeting.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.negotiated.greeting.server_version
    }

    /// Negotiated capability flags.
    pub fn capabilities(&self) -> u32 {
        self.negotiated.capabilities
    }

    /// Name of the plugin that authenticated this session.
    pub fn auth_plugin(&self) -> &str {
        &self.negotiated.plugin
    }

    pub fn state(&self) -> &ServerSessionState {
        &self.state
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    /// Handle that aborts a blocked read from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        self.transport.close_handle()
    }

    /// Run a statement through the interceptor chain.
    ///
    /// Returns the first result; further results of a multi-statement are
    /// read and discarded so the session stays in sync.
    #[allow(clippy::result_large_err)]
    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        let mut chain = std::mem::take(&mut self.interceptors);
        let result = chain.run(sql, |sql| self.query(sql));
        self.interceptors = chain;
        result
    }

    /// Re-authenticate as another account on the same transport.
    ///
    /// On failure the session is closed.
    #[allow(clippy::result_large_err)]
    pub fn change_user(
        &mut self,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<()> {
        let creds = Credentials {
            user,
            password,
            database,
        };
        let result = Handshake::new(&mut self.transport, &self.registry, &self.auth_options)
            .change_user(&self.negotiated, &self.config, creds);
        let ok = match result {
            Ok(ok) => ok,
            Err(e) => {
                self.transport.close();
                return Err(e);
            }
        };
        self.state.reset();
        self.state.apply_ok(&ok)?;
        self.state.set_schema(database.map(str::to_string));
        self.config.user = user.to_string();
        self.config.password = password.map(str::to_string);
        self.config.database = database.map(str::to_string);
        Ok(())
    }

    /// `COM_PING`.
    #[allow(clippy::result_large_err)]
    pub fn ping(&mut self) -> Result<()> {
        self.simple_command(Command::Ping, &[]).map(drop)
    }

    /// `COM_INIT_DB`: switch the default schema.
    #[allow(clippy::result_large_err)]
    pub fn use_database(&mut self, database: &str) -> Result<()> {
        self.simple_command(Command::InitDb, database.as_bytes())?;
        self.state.set_schema(Some(database.to_string()));
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// `COM_RESET_CONNECTION`: drop session variables and temporary state
    /// without re-authenticating.
    #[allow(clippy::result_large_err)]
    pub fn reset(&mut self) -> Result<()> {
        let schema = self.state.schema().map(str::to_string);
        self.simple_command(Command::ResetConnection, &[])?;
        self.state.reset();
        self.state.set_schema(schema);
        Ok(())
    }

    /// Toggle autocommit, sending nothing if the server already matches.
    /// Returns whether a statement was sent.
    #[allow(clippy::result_large_err)]
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<bool> {
        if !self.state.needs_autocommit_change(enabled) {
            return Ok(false);
        }
        self.query(if enabled {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        })?;
        Ok(true)
    }

    /// Send `COM_QUIT` and close the transport. Idempotent.
    pub fn close(&mut self) {
        if !self.transport.is_open() {
            return;
        }
        self.transport.reset_sequence();
        if let Err(e) = self.transport.write_packet(&[Command::Quit as u8]) {
            tracing::debug!(error = %e, "COM_QUIT failed");
        }
        self.transport.close();
    }

    #[allow(clippy::result_large_err)]
    fn simple_command(&mut self, command: Command, arg: &[u8]) -> Result<OkPacket> {
        let mut writer = PacketWriter::command(command);
        writer.write_bytes(arg);
        self.transport.reset_sequence();
        self.transport.write_packet(writer.as_bytes())?;

        let payload = self.transport.read_packet()?;
        match PacketType::of(&payload) {
            PacketType::Ok => {
                let ok = self.parse_ok(&payload)?;
                self.state.apply_ok(&ok)?;
                Ok(ok)
            }
            PacketType::Error => Err(server_error(&payload)),
            _ => Err(unexpected(&format!("{command:?} response"), &payload)),
        }
    }

    #[allow(clippy::result_large_err)]
    fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let mut writer = PacketWriter::command(Command::Query);
        writer.write_bytes(sql.as_bytes());
        self.transport.reset_sequence();
        self.transport.write_packet(writer.as_bytes())?;
        tracing::trace!(len = sql.len(), "sent COM_QUERY");

        let first = self.read_result();
        let mut extra = 0usize;
        // The server keeps streaming results until the flag clears, even after an error.
        while self.transport.is_open() && self.state.more_results_exist() {
            extra += 1;
            if let Err(e) = self.read_result() {
                tracing::debug!(error = %e, "error in discarded result");
                if !self.transport.is_open() {
                    return Err(e);
                }
            }
        }
        if extra > 0 {
            tracing::debug!(discarded = extra, "discarded additional results");
        }
        first
    }

    #[allow(clippy::result_large_err)]
    fn read_result(&mut self) -> Result<QueryResult> {
        let payload = self.transport.read_packet()?;
        match PacketType::of(&payload) {
            PacketType::Ok => {
                let ok = self.parse_ok(&payload)?;
                let phase = self.state.apply_ok(&ok)?;
                Ok(QueryResult::from_ok(&ok, phase))
            }
            PacketType::Error => {
                // No status word follows an error; nothing else is pending.
                let flags = self.state.status_flags()
                    & !crate::protocol::server_status::SERVER_MORE_RESULTS_EXISTS;
                self.state.apply(flags, false);
                Err(server_error(&payload))
            }
            PacketType::LocalInfile => {
                tracing::debug!("declining LOCAL INFILE request");
                self.transport.write_packet(&[])?;
                self.read_result()
            }
            _ if payload.is_empty() => Err(unexpected("query response", &payload)),
            _ => self.read_result_set(&payload),
        }
    }

    #[allow(clippy::result_large_err)]
    fn read_result_set(&mut self, first: &[u8]) -> Result<QueryResult> {
        let column_count = PacketReader::new(first)
            .read_lenenc_int()
            .ok_or_else(|| unexpected("column count", first))?;
        let mut columns = Vec::new();
        for _ in 0..column_count {
            let payload = self.transport.read_packet()?;
            columns.push(ColumnDefinition::parse(&payload)?);
        }

        let deprecate_eof = self.negotiated.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0;
        if !deprecate_eof {
            let payload = self.transport.read_packet()?;
            let eof = (PacketType::of(&payload) == PacketType::Eof)
                .then(|| PacketReader::new(&payload).parse_eof_packet())
                .flatten()
                .ok_or_else(|| unexpected("EOF after column definitions", &payload))?;
            self.state.apply(eof.status_flags, false);
        }

        let mut rows = Vec::new();
        let mut row_error = None;
        loop {
            let payload = self.transport.read_packet()?;
            if is_end_of_rows(&payload, deprecate_eof) {
                let (status, warnings, affected_rows, last_insert_id, info) = if deprecate_eof {
                    let ok = self.parse_ok(&payload)?;
                    self.state.apply_ok(&ok)?;
                    (ok.status_flags, ok.warnings, ok.affected_rows, ok.last_insert_id, ok.info)
                } else {
                    let eof = PacketReader::new(&payload)
                        .parse_eof_packet()
                        .ok_or_else(|| unexpected("EOF packet", &payload))?;
                    self.state.apply(eof.status_flags, true);
                    (eof.status_flags, eof.warnings, 0, 0, String::new())
                };
                tracing::trace!(rows = rows.len(), status, "result set complete");
                if let Some(e) = row_error {
                    return Err(e);
                }
                return Ok(QueryResult {
                    columns,
                    rows,
                    affected_rows,
                    last_insert_id,
                    warnings,
                    info,
                    phase: self.state.transaction_phase(),
                });
            }
            if PacketType::of(&payload) == PacketType::Error {
                return Err(server_error(&payload));
            }
            // A bad value spoils its row only; keep reading to stay in sync.
            match Row::from_text(&payload, &columns, &mut self.decoder) {
                Ok(row) => rows.push(row),
                Err(e) if row_error.is_none() => row_error = Some(e),
                Err(_) => {}
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn parse_ok(&self, payload: &[u8]) -> Result<OkPacket> {
        PacketReader::new(payload)
            .parse_ok_packet(self.negotiated.capabilities)
            .ok_or_else(|| unexpected("OK packet", payload))
    }
}

impl Drop for MySqlSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_end_of_rows(payload: &[u8], deprecate_eof: bool) -> bool {
    match payload.first() {
        Some(0xFE) if deprecate_eof => payload.len() < MAX_PACKET_SIZE,
        Some(0xFE) => payload.len() < 9,
        _ => false,
    }
}

fn server_error(payload: &[u8]) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => Error::Server(err.into_server_error()),
        None => unexpected("ERR packet", payload),
    }
}

fn unexpected(what: &str, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("malformed {what}"),
        raw_data: Some(payload.to_vec()),
    })
}

impl ManagedSession for MySqlSession {
    fn xa_start(&mut self, xid: &Xid) -> Result<()> {
        self.execute(&format!("XA START {}", xid.to_sql())).map(drop)
    }

    fn xa_end(&mut self, xid: &Xid) -> Result<()> {
        self.execute(&format!("XA END {}", xid.to_sql())).map(drop)
    }

    fn xa_prepare(&mut self, xid: &Xid) -> Result<()> {
        self.execute(&format!("XA PREPARE {}", xid.to_sql())).map(drop)
    }

    fn xa_commit(&mut self, xid: &Xid, one_phase: bool) -> Result<()> {
        let suffix = if one_phase { " ONE PHASE" } else { "" };
        self.execute(&format!("XA COMMIT {}{suffix}", xid.to_sql())).map(drop)
    }

    fn xa_rollback(&mut self, xid: &Xid) -> Result<()> {
        self.execute(&format!("XA ROLLBACK {}", xid.to_sql())).map(drop)
    }

    fn is_alive(&mut self) -> bool {
        self.transport.is_open() && self.ping().is_ok()
    }

    fn close(&mut self) {
        MySqlSession::close(self);
    }
}

/// Opens TCP sessions for the pool, one per requested account.
#[derive(Debug, Clone)]
pub struct MySqlSessionFactory {
    config: MySqlConfig,
}

impl MySqlSessionFactory {
    /// `config` supplies everything except the credentials.
    pub fn new(config: MySqlConfig) -> Self {
        Self { config }
    }

    /// Configuration used for `account`.
    pub fn config_for(&self, account: &Account) -> MySqlConfig {
        let mut config = self.config.clone();
        config.user.clone_from(&account.user);
        config.password.clone_from(&account.password);
        config
    }
}

impl SessionFactory for MySqlSessionFactory {
    type Session = MySqlSession;

    fn create(&self, account: &Account) -> Result<MySqlSession> {
        MySqlSession::connect(self.config_for(account))
    }
}
