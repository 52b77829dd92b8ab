//! MySQL wire protocol primitives.
//!
//! Every packet carries a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Payloads of `MAX_PACKET_SIZE` bytes or more are split across several
//! physical packets; see [`split_payload`].

pub mod reader;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single physical packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities requested by default, before intersecting with the server.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF;
}

/// Command codes (COM_xxx) this client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the session
    Quit = 0x01,
    /// Switch default schema
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Liveness probe
    Ping = 0x0e,
    /// Re-authenticate on the same transport
    ChangeUser = 0x11,
    /// Reset session state without re-authenticating
    ResetConnection = 0x1f,
}

/// Server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Session-state tracking entry types carried in OK packets.
pub mod session_track {
    pub const SYSTEM_VARIABLES: u8 = 0x00;
    pub const SCHEMA: u8 = 0x01;
    pub const STATE_CHANGE: u8 = 0x02;
    pub const GTIDS: u8 = 0x03;
    pub const TRANSACTION_CHARACTERISTICS: u8 = 0x04;
    pub const TRANSACTION_STATE: u8 = 0x05;
}

/// A packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Frame `payload` into physical packets starting at `sequence_id`.
///
/// Chunks of exactly `max_chunk` bytes are followed by further chunks with
/// consecutive sequence numbers; a payload that is an exact multiple of
/// `max_chunk` (including zero) ends with an empty packet. Returns the framed
/// bytes and the sequence number following the last packet written.
#[allow(clippy::cast_possible_truncation)]
pub fn split_payload(payload: &[u8], mut sequence_id: u8, max_chunk: usize) -> (Vec<u8>, u8) {
    let chunks = payload.len() / max_chunk + 1;
    let mut out = Vec::with_capacity(payload.len() + chunks * PacketHeader::SIZE);
    let mut offset = 0;
    loop {
        let chunk_len = (payload.len() - offset).min(max_chunk);
        let header = PacketHeader {
            payload_length: chunk_len as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload[offset..offset + chunk_len]);
        offset += chunk_len;
        sequence_id = sequence_id.wrapping_add(1);
        if chunk_len < max_chunk {
            break;
        }
    }
    (out, sequence_id)
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with a short payload)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Anything else (row data, column definitions, ...)
    Data,
}

impl PacketType {
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    /// Classify a whole payload.
    pub fn of(payload: &[u8]) -> Self {
        match payload.first() {
            Some(&b) => Self::from_first_byte(b, payload.len()),
            None => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    /// Raw session-state-change block (present with `CLIENT_SESSION_TRACK`
    /// and `SERVER_SESSION_STATE_CHANGED`)
    pub session_state: Vec<u8>,
}

/// Parsed ERR packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQL state (5 characters, empty for pre-4.1 style errors)
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn into_server_error(self) -> sqlwire_core::ServerError {
        sqlwire_core::ServerError {
            code: self.error_code,
            sqlstate: self.sql_state,
            message: self.error_message,
        }
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_max_size() {
        #[allow(clippy::cast_possible_truncation)]
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
        assert_eq!(PacketHeader::from_bytes(&[0x56, 0x34, 0x12, 7]).payload_length, 0x0012_3456);
    }

    #[test]
    fn test_split_small_payload_is_single_packet() {
        let (framed, next) = split_payload(b"abc", 4, 8);
        assert_eq!(framed, vec![3, 0, 0, 4, b'a', b'b', b'c']);
        assert_eq!(next, 5);
    }

    #[test]
    fn test_split_exact_multiple_adds_terminator() {
        let payload = [7u8; 8];
        let (framed, next) = split_payload(&payload, 0, 4);
        // two full chunks and an empty terminator
        assert_eq!(framed.len(), 3 * 4 + 8);
        assert_eq!(&framed[0..4], &[4, 0, 0, 0]);
        assert_eq!(&framed[8..12], &[4, 0, 0, 1]);
        assert_eq!(&framed[16..20], &[0, 0, 0, 2]);
        assert_eq!(next, 3);
    }

    #[test]
    fn test_split_sequence_wraps() {
        let (framed, next) = split_payload(&[1u8; 5], 255, 4);
        assert_eq!(framed[3], 255);
        assert_eq!(framed[11], 0);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(PacketType::from_first_byte(0x00, 10), PacketType::Ok);
        assert_eq!(PacketType::from_first_byte(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::from_first_byte(0xFE, 5), PacketType::Eof);
        assert_eq!(PacketType::from_first_byte(0xFE, 100), PacketType::Data);
        assert_eq!(PacketType::of(&[]), PacketType::Data);
    }
}
