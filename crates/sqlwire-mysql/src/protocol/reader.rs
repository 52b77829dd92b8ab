//! Cursor over a packet payload.
//!
//! Every read returns `None` when the payload is too short, leaving the
//! caller to turn that into a protocol or decode error with context.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::capabilities::CLIENT_SESSION_TRACK;
use crate::protocol::server_status::SERVER_SESSION_STATE_CHANGED;
use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// A reader for MySQL protocol data.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        let [a, b, c] = self.read_array()?;
        Some(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFC / 0xFD / 0xFE: 2 / 3 / 8 byte value follows
    /// - 0xFB (NULL) and 0xFF (reserved) yield `None`
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a length-encoded string, replacing invalid UTF-8.
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read one text-protocol row field.
    ///
    /// The outer `None` means the payload is truncated; `Some(None)` is SQL NULL
    /// (the 0xFB marker).
    pub fn read_lenenc_field(&mut self) -> Option<Option<&'a [u8]>> {
        if self.peek()? == 0xFB {
            self.pos += 1;
            return Some(None);
        }
        self.read_lenenc_bytes().map(Some)
    }

    /// Read up to (not including) the next NUL; the NUL is consumed.
    ///
    /// A missing terminator takes the rest of the payload.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet (leading 0x00 or 0xFE marker optional).
    ///
    /// With `CLIENT_SESSION_TRACK` the info string is length-encoded and may be
    /// followed by a session-state block when the server flags a change.
    pub fn parse_ok_packet(&mut self, capabilities: u32) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;

        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            ..OkPacket::default()
        };

        if capabilities & CLIENT_SESSION_TRACK != 0 {
            if !self.is_empty() {
                ok.info = self.read_lenenc_string()?;
            }
            if status_flags & SERVER_SESSION_STATE_CHANGED != 0 && !self.is_empty() {
                ok.session_state = self.read_lenenc_bytes()?.to_vec();
            }
        } else {
            ok.info = self.read_rest_string();
        }
        Some(ok)
    }

    /// Parse an ERR packet (leading 0xFF marker optional).
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message: self.read_rest_string(),
        })
    }

    /// Parse an EOF packet (leading 0xFE marker optional).
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }
        Some(EofPacket {
            warnings: self.read_u16_le()?,
            status_flags: self.read_u16_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_reads() {
        let mut reader = PacketReader::new(&[0x34, 0x12, 0x56, 0x34, 0x12, 0x78]);
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u16_le(), None);
        // a failed read does not consume
        assert_eq!(reader.read_u8(), Some(0x78));
    }

    #[test]
    fn test_read_lenenc_int() {
        let mut reader = PacketReader::new(&[0x42]);
        assert_eq!(reader.read_lenenc_int(), Some(0x42));

        let mut reader = PacketReader::new(&[0xFC, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x1234));

        let mut reader = PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0012_3456));

        let mut reader = PacketReader::new(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0807_0605_0403_0201));

        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc_int(), None);
    }

    #[test]
    fn test_read_lenenc_field_null_and_value() {
        let mut reader = PacketReader::new(&[0xFB, 0x02, b'h', b'i', 0x00, 0x05]);
        assert_eq!(reader.read_lenenc_field(), Some(None));
        assert_eq!(reader.read_lenenc_field(), Some(Some(&b"hi"[..])));
        assert_eq!(reader.read_lenenc_field(), Some(Some(&b""[..])));
        // length 5 but nothing follows
        assert_eq!(reader.read_lenenc_field(), None);
    }

    #[test]
    fn test_read_null_string() {
        let mut reader = PacketReader::new(b"hello\0world");
        assert_eq!(reader.read_null_string(), "hello");
        assert_eq!(reader.read_null_string(), "world");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_ok_packet_plain() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet(0).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert!(ok.session_state.is_empty());
    }

    #[test]
    fn test_parse_ok_packet_with_session_state() {
        // status = AUTOCOMMIT | SESSION_STATE_CHANGED
        let mut data = vec![0x00, 0x00, 0x00, 0x02, 0x40, 0x00, 0x00];
        data.push(0x00); // empty info
        data.extend_from_slice(&[0x03, 0x01, 0x01, b'x']);
        let ok = PacketReader::new(&data)
            .parse_ok_packet(CLIENT_SESSION_TRACK)
            .unwrap();
        assert_eq!(ok.info, "");
        assert_eq!(ok.session_state, vec![0x01, 0x01, b'x']);
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_parse_eof_packet() {
        let data = [0xFE, 0x00, 0x00, 0x02, 0x00];
        let eof = PacketReader::new(&data).parse_eof_packet().unwrap();
        assert_eq!(eof.warnings, 0);
        assert_eq!(eof.status_flags, 2);
    }
}
