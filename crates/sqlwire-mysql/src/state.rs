//! Server-side session state as reported in OK and EOF packets.

use std::collections::HashMap;

use sqlwire_core::Result;
use sqlwire_core::error::ProtocolError;

use crate::charset::Encoding;
use crate::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_CURSOR_EXISTS,
    SERVER_STATUS_IN_TRANS, SERVER_STATUS_LAST_ROW_SENT, SERVER_STATUS_NO_BACKSLASH_ESCAPES,
};
use crate::protocol::{OkPacket, PacketReader, session_track};

/// Transaction phase derived from the in-transaction bit of two consecutive
/// status words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionPhase {
    /// 0 -> 0
    #[default]
    NotStarted,
    /// 1 -> 1
    InProgress,
    /// 0 -> 1
    Started,
    /// 1 -> 0
    Completed,
}

impl TransactionPhase {
    fn between(old: u16, new: u16) -> Self {
        let was = old & SERVER_STATUS_IN_TRANS != 0;
        let is = new & SERVER_STATUS_IN_TRANS != 0;
        match (was, is) {
            (false, false) => TransactionPhase::NotStarted,
            (true, true) => TransactionPhase::InProgress,
            (false, true) => TransactionPhase::Started,
            (true, false) => TransactionPhase::Completed,
        }
    }
}

/// Per-session view of the server's state.
#[derive(Debug, Clone, Default)]
pub struct ServerSessionState {
    status_flags: u16,
    old_status_flags: u16,
    charset_index: u16,
    variables: HashMap<String, String>,
    long_column_info: bool,
    server_version: String,
    schema: Option<String>,
}

impl ServerSessionState {
    pub fn new(server_version: impl Into<String>, charset_index: u16, status_flags: u16) -> Self {
        Self {
            status_flags,
            old_status_flags: status_flags,
            charset_index,
            server_version: server_version.into(),
            ..Self::default()
        }
    }

    /// Record a new status word.
    ///
    /// With `save_old` the current word becomes the previous one first; without
    /// it the previous word is left alone (used for intermediate packets of a
    /// multi-packet response).
    pub fn apply(&mut self, status_flags: u16, save_old: bool) -> TransactionPhase {
        if save_old {
            self.old_status_flags = self.status_flags;
        }
        self.status_flags = status_flags;
        let phase = self.transaction_phase();
        tracing::debug!(
            status = status_flags,
            ?phase,
            "server status updated"
        );
        phase
    }

    /// Apply an OK packet: status word plus any session-state tracking data.
    pub fn apply_ok(&mut self, ok: &OkPacket) -> Result<TransactionPhase> {
        let phase = self.apply(ok.status_flags, true);
        if !ok.session_state.is_empty() {
            self.apply_session_track(&ok.session_state)?;
        }
        Ok(phase)
    }

    /// Consume a `CLIENT_SESSION_TRACK` state-change block.
    pub fn apply_session_track(&mut self, data: &[u8]) -> Result<()> {
        let malformed = || ProtocolError {
            message: "malformed session state change block".to_string(),
            raw_data: Some(data.to_vec()),
        };
        let mut reader = PacketReader::new(data);
        while !reader.is_empty() {
            let kind = reader.read_u8().ok_or_else(malformed)?;
            let entry = reader.read_lenenc_bytes().ok_or_else(malformed)?;
            let mut entry = PacketReader::new(entry);
            match kind {
                session_track::SYSTEM_VARIABLES => {
                    let name = entry.read_lenenc_string().ok_or_else(malformed)?;
                    let value = entry.read_lenenc_string().ok_or_else(malformed)?;
                    tracing::trace!(%name, %value, "tracked system variable");
                    self.variables.insert(name, value);
                }
                session_track::SCHEMA => {
                    let schema = entry.read_lenenc_string().ok_or_else(malformed)?;
                    tracing::trace!(%schema, "tracked schema change");
                    self.schema = Some(schema);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn transaction_phase(&self) -> TransactionPhase {
        TransactionPhase::between(self.old_status_flags, self.status_flags)
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn old_status_flags(&self) -> u16 {
        self.old_status_flags
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & SERVER_STATUS_IN_TRANS != 0
    }

    pub fn is_autocommit(&self) -> bool {
        self.status_flags & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    pub fn cursor_exists(&self) -> bool {
        self.status_flags & SERVER_STATUS_CURSOR_EXISTS != 0
    }

    pub fn last_row_sent(&self) -> bool {
        self.status_flags & SERVER_STATUS_LAST_ROW_SENT != 0
    }

    pub fn more_results_exist(&self) -> bool {
        self.status_flags & SERVER_MORE_RESULTS_EXISTS != 0
    }

    /// Whether `SET autocommit` has to be sent to reach `desired`.
    pub fn needs_autocommit_change(&self, desired: bool) -> bool {
        self.is_autocommit() != desired
    }

    pub fn charset_index(&self) -> u16 {
        self.charset_index
    }

    pub fn set_charset_index(&mut self, index: u16) {
        self.charset_index = index;
    }

    /// Encoding of the session charset.
    pub fn encoding(&self) -> Result<Encoding> {
        Encoding::for_collation(self.charset_index)
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn has_long_column_info(&self) -> bool {
        self.long_column_info
    }

    pub fn set_long_column_info(&mut self, value: bool) {
        self.long_column_info = value;
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Current schema, as last reported by the server.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn set_schema(&mut self, schema: Option<String>) {
        self.schema = schema;
    }

    /// Compare the server version against `major.minor.patch`.
    ///
    /// Suffixes such as `-log` or `-MariaDB` are ignored.
    pub fn version_at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        let mut parts = self
            .server_version
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u32>().unwrap_or(0));
        let actual = (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        );
        actual >= (major, minor, patch)
    }

    /// Forget tracked variables after a change-user or reset.
    pub fn reset(&mut self) {
        self.variables.clear();
        self.schema = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    #[test]
    fn test_transaction_phase_transitions() {
        let mut state = ServerSessionState::new("8.0.36", 255, SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(
            state.apply(SERVER_STATUS_AUTOCOMMIT, true),
            TransactionPhase::NotStarted
        );
        assert_eq!(state.apply(SERVER_STATUS_IN_TRANS, true), TransactionPhase::Started);
        assert_eq!(state.apply(SERVER_STATUS_IN_TRANS, true), TransactionPhase::InProgress);
        assert_eq!(state.apply(SERVER_STATUS_AUTOCOMMIT, true), TransactionPhase::Completed);
    }

    #[test]
    fn test_apply_without_save_keeps_old() {
        let mut state = ServerSessionState::new("8.0.36", 255, 0);
        state.apply(SERVER_STATUS_IN_TRANS, true);
        assert_eq!(state.apply(0, false), TransactionPhase::NotStarted);
        assert_eq!(state.old_status_flags(), 0);
    }

    #[test]
    fn test_status_helpers() {
        let mut state = ServerSessionState::default();
        state.apply(
            SERVER_STATUS_AUTOCOMMIT | SERVER_STATUS_NO_BACKSLASH_ESCAPES | SERVER_MORE_RESULTS_EXISTS,
            true,
        );
        assert!(state.is_autocommit());
        assert!(state.no_backslash_escapes());
        assert!(state.more_results_exist());
        assert!(!state.cursor_exists());
        assert!(!state.last_row_sent());
        assert!(!state.needs_autocommit_change(true));
        assert!(state.needs_autocommit_change(false));
    }

    #[test]
    fn test_session_track_variables_and_schema() {
        let mut entry = PacketWriter::new();
        entry.write_lenenc_string("time_zone");
        entry.write_lenenc_string("+00:00");
        let mut schema = PacketWriter::new();
        schema.write_lenenc_string("inventory");

        let mut block = PacketWriter::new();
        block.write_u8(session_track::SYSTEM_VARIABLES);
        block.write_lenenc_bytes(entry.as_bytes());
        block.write_u8(session_track::SCHEMA);
        block.write_lenenc_bytes(schema.as_bytes());
        block.write_u8(session_track::GTIDS);
        block.write_lenenc_bytes(&[0, 1, b'x']);

        let mut state = ServerSessionState::default();
        state.apply_session_track(block.as_bytes()).unwrap();
        assert_eq!(state.variable("time_zone"), Some("+00:00"));
        assert_eq!(state.schema(), Some("inventory"));
    }

    #[test]
    fn test_truncated_session_track_is_error() {
        let mut state = ServerSessionState::default();
        assert!(state.apply_session_track(&[0x00, 0x05, 0x01]).is_err());
    }

    #[test]
    fn test_version_at_least() {
        let state = ServerSessionState::new("8.0.36-log", 255, 0);
        assert!(state.version_at_least(8, 0, 4));
        assert!(state.version_at_least(8, 0, 36));
        assert!(!state.version_at_least(8, 1, 0));
    }

    #[test]
    fn test_session_encoding() {
        let state = ServerSessionState::new("8.0.36", 8, 0);
        assert_eq!(state.encoding().unwrap(), Encoding::Latin1);
    }
}
