//! Scripted server for integration tests.

#![allow(dead_code)]

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlwire_core::Result;
use sqlwire_mysql::protocol::{PacketHeader, PacketWriter, capabilities};
use sqlwire_mysql::{Channel, ChannelShutdown, TlsUpgrader};

pub type Sent = Arc<Mutex<Vec<u8>>>;

/// Replays the bytes a server would send.
pub struct ScriptedChannel {
    incoming: Cursor<Vec<u8>>,
    sent: Sent,
}

impl ScriptedChannel {
    pub fn new(script: Script) -> (Self, Sent) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel = Self {
            incoming: Cursor::new(script.bytes),
            sent: Arc::clone(&sent),
        };
        (channel, sent)
    }
}

impl Read for ScriptedChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.incoming.read(buf)
    }
}

impl Write for ScriptedChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for ScriptedChannel {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown_handle(&self) -> Option<Box<dyn ChannelShutdown>> {
        None
    }
}

/// Wraps the plaintext channel and reports it encrypted.
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

/// Upgrader that records how many bytes the client had sent when it ran.
#[derive(Default)]
pub struct FakeTls {
    pub sent_before_upgrade: Mutex<Option<usize>>,
    pub watched: Mutex<Option<Sent>>,
}

impl FakeTls {
    pub fn watching(sent: &Sent) -> Self {
        Self {
            sent_before_upgrade: Mutex::new(None),
            watched: Mutex::new(Some(Arc::clone(sent))),
        }
    }
}

impl TlsUpgrader for FakeTls {
    fn upgrade(&self, channel: Box<dyn Channel>, _server_name: &str) -> Result<Box<dyn Channel>> {
        if let Some(sent) = self.watched.lock().as_ref() {
            *self.sent_before_upgrade.lock() = Some(sent.lock().len());
        }
        Ok(Box::new(Encrypted(channel)))
    }
}

/// Server side of a conversation, packet by packet.
#[derive(Default)]
pub struct Script {
    bytes: Vec<u8>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn packet(mut self, seq: u8, payload: &[u8]) -> Self {
        let header = PacketHeader {
            payload_length: payload.len() as u32,
            sequence_id: seq,
        };
        self.bytes.extend_from_slice(&header.to_bytes());
        self.bytes.extend_from_slice(payload);
        self
    }
}

pub const SEED: [u8; 20] = [
    0x3a, 0x11, 0x52, 0x7c, 0x05, 0x6e, 0x29, 0x41, 0x0f, 0x63, 0x18, 0x7a, 0x24, 0x5d, 0x33,
    0x08, 0x6b, 0x47, 0x1c, 0x59,
];

#[allow(clippy::cast_possible_truncation)]
pub fn greeting(caps: u32, plugin: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36");
    w.write_u32_le(42);
    w.write_bytes(&SEED[..8]);
    w.write_u8(0);
    w.write_u16_le(caps as u16);
    w.write_u8(255);
    w.write_u16_le(0x0002);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SEED[8..]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

pub fn server_caps() -> u32 {
    capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_WITH_DB
}

pub fn ok() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

pub fn err(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(state.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

pub fn auth_switch(plugin: &str, seed: &[u8]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_null_string(plugin);
    w.write_bytes(seed);
    w.write_u8(0);
    w.into_bytes()
}

/// Split the client's output back into `(seq, payload)` packets.
pub fn packets(sent: &Sent) -> Vec<(u8, Vec<u8>)> {
    let bytes = sent.lock().clone();
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 4 <= bytes.len() {
        let len = usize::from(bytes[pos]) | usize::from(bytes[pos + 1]) << 8 | usize::from(bytes[pos + 2]) << 16;
        let seq = bytes[pos + 3];
        out.push((seq, bytes[pos + 4..pos + 4 + len].to_vec()));
        pos += 4 + len;
    }
    out
}
