//! Scripted channels and packet builders for unit tests.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use sqlwire_core::Result;

use crate::protocol::{PacketHeader, PacketWriter, capabilities};
use crate::tls::TlsUpgrader;
use crate::transport::{Channel, ChannelShutdown};
use crate::types::FieldType;

type Gate = Arc<(Mutex<bool>, Condvar)>;

enum Mode {
    Script,
    TimingOut,
    Blocking(Gate),
}

/// Channel replaying canned server bytes and recording what the client sends.
pub struct MockChannel {
    incoming: io::Cursor<Vec<u8>>,
    sent: Arc<Mutex<Vec<u8>>>,
    mode: Mode,
}

impl MockChannel {
    pub fn new(server_bytes: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        Self::with_mode(server_bytes, Mode::Script)
    }

    /// Every read fails with `TimedOut`.
    pub fn timing_out() -> (Self, Arc<Mutex<Vec<u8>>>) {
        Self::with_mode(Vec::new(), Mode::TimingOut)
    }

    /// Reads block until the shutdown handle fires.
    pub fn blocking() -> (Self, Arc<Mutex<Vec<u8>>>) {
        Self::with_mode(Vec::new(), Mode::Blocking(Arc::new((Mutex::new(false), Condvar::new()))))
    }

    fn with_mode(server_bytes: Vec<u8>, mode: Mode) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel = Self {
            incoming: io::Cursor::new(server_bytes),
            sent: Arc::clone(&sent),
            mode,
        };
        (channel, sent)
    }
}

impl Read for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.mode {
            Mode::Script => self.incoming.read(buf),
            Mode::TimingOut => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
            Mode::Blocking(gate) => {
                let (lock, cvar) = &**gate;
                let mut shut = lock.lock();
                while !*shut {
                    cvar.wait(&mut shut);
                }
                Err(io::Error::new(io::ErrorKind::NotConnected, "shut down"))
            }
        }
    }
}

impl Write for MockChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct GateShutdown(Gate);

impl ChannelShutdown for GateShutdown {
    fn shutdown(&self) -> io::Result<()> {
        let (lock, cvar) = &*self.0;
        *lock.lock() = true;
        cvar.notify_all();
        Ok(())
    }
}

impl Channel for MockChannel {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown_handle(&self) -> Option<Box<dyn ChannelShutdown>> {
        match &self.mode {
            Mode::Blocking(gate) => Some(Box::new(GateShutdown(Arc::clone(gate)))),
            _ => None,
        }
    }
}

/// Pretends to negotiate TLS: the wrapped channel reports itself encrypted.
#[derive(Debug, Default)]
pub struct FakeTls {
    pub server_names: Mutex<Vec<String>>,
}

struct Encrypted(Box<dyn Channel>);

impl Read for Encrypted {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for Encrypted {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Channel for Encrypted {
    fn is_encrypted(&self) -> bool {
        true
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(timeout)
    }

    fn shutdown_handle(&self) -> Option<Box<dyn ChannelShutdown>> {
        self.0.shutdown_handle()
    }
}

impl TlsUpgrader for FakeTls {
    fn upgrade(&self, channel: Box<dyn Channel>, server_name: &str) -> Result<Box<dyn Channel>> {
        self.server_names.lock().push(server_name.to_string());
        Ok(Box::new(Encrypted(channel)))
    }
}

/// Frame one payload as a single packet.
#[allow(clippy::cast_possible_truncation)]
pub fn framed(seq: u8, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader {
        payload_length: payload.len() as u32,
        sequence_id: seq,
    };
    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Protocol 10 greeting with connection id 7.
#[allow(clippy::cast_possible_truncation)]
pub fn greeting_payload(version: &str, seed: &[u8], caps: u32, plugin: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string(version);
    w.write_u32_le(7);
    w.write_bytes(&seed[..8]);
    w.write_u8(0);
    w.write_u16_le(caps as u16);
    w.write_u8(255);
    w.write_u16_le(0x0002);
    w.write_u16_le((caps >> 16) as u16);
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        w.write_u8(seed.len() as u8 + 1);
    } else {
        w.write_u8(0);
    }
    w.write_zeros(10);
    if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        w.write_bytes(&seed[8..]);
        w.write_u8(0);
    }
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        w.write_null_string(plugin);
    }
    w.into_bytes()
}

/// OK packet as sent with `CLIENT_SESSION_TRACK`.
pub fn ok_payload(affected_rows: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

pub fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sqlstate.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

/// End-of-rows marker in its `CLIENT_DEPRECATE_EOF` OK form.
pub fn eof_ok_payload(status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_lenenc_int(0);
    w.write_lenenc_int(0);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

pub fn column_payload(name: &str, ty: FieldType, charset: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("app");
    w.write_lenenc_string("t");
    w.write_lenenc_string("t");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(charset);
    w.write_u32_le(255);
    w.write_u8(ty as u8);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

pub fn text_row_payload(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}
