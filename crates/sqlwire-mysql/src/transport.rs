//! Packet transport over a byte channel.
//!
//! `PacketTransport` owns the channel of one session. It frames payloads into
//! sequence-numbered packets, reassembles split payloads, optionally wraps
//! everything in the zlib compression envelope, and becomes permanently
//! closed after the first I/O failure.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sqlwire_core::error::{TransportError, TransportErrorKind};
use sqlwire_core::{Error, Result};

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, split_payload};
use crate::tls::TlsUpgrader;

/// Payloads shorter than this are sent stored in the compression envelope.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Size of the compression envelope header.
const COMPRESSED_HEADER_SIZE: usize = 7;

/// A raw byte channel a session runs over.
pub trait Channel: Read + Write + Send {
    /// Whether bytes on this channel are encrypted.
    fn is_encrypted(&self) -> bool {
        false
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// A handle able to abort blocked reads and writes from another thread.
    fn shutdown_handle(&self) -> Option<Box<dyn ChannelShutdown>>;
}

/// Out-of-band shutdown of a channel.
pub trait ChannelShutdown: Send + Sync {
    fn shutdown(&self) -> io::Result<()>;
}

impl Channel for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown_handle(&self) -> Option<Box<dyn ChannelShutdown>> {
        self.try_clone()
            .ok()
            .map(|clone| Box::new(clone) as Box<dyn ChannelShutdown>)
    }
}

impl ChannelShutdown for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

struct CloseState {
    closed: AtomicBool,
    shutdown: Option<Box<dyn ChannelShutdown>>,
}

/// Closes a transport from any thread.
///
/// Closing marks the transport closed and shuts the underlying channel down,
/// so a read blocked on another thread returns promptly with an error.
#[derive(Clone)]
pub struct CloseHandle {
    state: Arc<CloseState>,
}

impl CloseHandle {
    pub fn close(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            if let Some(shutdown) = &self.state.shutdown {
                if let Err(e) = shutdown.shutdown() {
                    tracing::debug!(error = %e, "channel shutdown failed");
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Compression state: its own sequence counter plus decompressed bytes not yet
/// consumed by the packet layer.
#[derive(Debug, Default)]
struct Compressed {
    sequence: u8,
    inbox: Vec<u8>,
    inbox_pos: usize,
}

/// Framed, sequence-checked packet I/O for one session.
pub struct PacketTransport {
    channel: Option<Box<dyn Channel>>,
    sequence: u8,
    compressed: Option<Compressed>,
    max_chunk: usize,
    close: CloseHandle,
}

impl std::fmt::Debug for PacketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketTransport")
            .field("open", &self.is_open())
            .field("sequence", &self.sequence)
            .field("compressed", &self.compressed.is_some())
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl PacketTransport {
    /// Wrap a channel, applying `read_timeout` to it.
    pub fn new(mut channel: Box<dyn Channel>, read_timeout: Option<Duration>) -> Result<Self> {
        channel
            .set_read_timeout(read_timeout)
            .map_err(|e| Error::Transport(TransportError::from_io("set read timeout", e)))?;
        let shutdown = channel.shutdown_handle();
        Ok(Self {
            channel: Some(channel),
            sequence: 0,
            compressed: None,
            max_chunk: MAX_PACKET_SIZE,
            close: CloseHandle {
                state: Arc::new(CloseState {
                    closed: AtomicBool::new(false),
                    shutdown,
                }),
            },
        })
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some() && !self.close.is_closed()
    }

    pub fn is_encrypted(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_encrypted())
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    /// Sequence number the next packet (read or written) must carry.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// Start a new command exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        if let Some(compressed) = &mut self.compressed {
            compressed.sequence = 0;
        }
    }

    /// Switch to the compressed envelope. Only valid right after authentication.
    pub fn enable_compression(&mut self) {
        if self.compressed.is_none() {
            tracing::debug!("enabling zlib packet compression");
            self.compressed = Some(Compressed::default());
        }
    }

    /// Replace the channel with an encrypted one.
    pub fn upgrade(&mut self, upgrader: &dyn TlsUpgrader, server_name: &str) -> Result<()> {
        self.ensure_open()?;
        let Some(channel) = self.channel.take() else {
            return Err(closed_error());
        };
        match upgrader.upgrade(channel, server_name) {
            Ok(encrypted) => {
                tracing::debug!(server_name, "channel upgraded to TLS");
                self.channel = Some(encrypted);
                Ok(())
            }
            Err(e) => {
                self.close.close();
                Err(e)
            }
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Close the transport. Further calls fail with `TransportErrorKind::Closed`.
    pub fn close(&mut self) {
        self.close.close();
        self.channel = None;
    }

    #[cfg(test)]
    pub(crate) fn set_max_chunk(&mut self, max_chunk: usize) {
        self.max_chunk = max_chunk;
    }

    /// Read one logical payload, reassembling split packets.
    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let mut payload = Vec::new();
        loop {
            let mut raw = [0u8; PacketHeader::SIZE];
            self.fill(&mut raw)?;
            let header = PacketHeader::from_bytes(&raw);
            if header.sequence_id != self.sequence {
                return Err(self.desync(format!(
                    "packet sequence {} does not match expected {}",
                    header.sequence_id, self.sequence
                )));
            }
            self.sequence = self.sequence.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = payload.len();
            payload.resize(start + len, 0);
            self.fill(&mut payload[start..])?;
            tracing::trace!(seq = header.sequence_id, len, "read packet");

            if len < self.max_chunk {
                return Ok(payload);
            }
        }
    }

    /// Write one logical payload starting at the current sequence number.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let first = self.sequence;
        let (framed, next) = split_payload(payload, first, self.max_chunk);
        self.sequence = next;
        tracing::trace!(seq = first, len = payload.len(), "write packet");
        if self.compressed.is_some() {
            self.write_compressed(&framed)
        } else {
            self.write_raw(&framed)
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(closed_error())
        }
    }

    /// Mark the transport dead and convert `err` into a transport error.
    fn fail(&mut self, context: &str, err: io::Error) -> Error {
        let closed_underneath = self.close.is_closed();
        self.close();
        if closed_underneath {
            return closed_error();
        }
        let err = TransportError::from_io(context, err);
        tracing::debug!(kind = ?err.kind, error = %err.message, "transport failed");
        Error::Transport(err)
    }

    fn desync(&mut self, message: String) -> Error {
        self.close();
        tracing::debug!(error = %message, "protocol desync");
        Error::Transport(TransportError::new(
            TransportErrorKind::ProtocolDesync,
            message,
        ))
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(closed_error());
        };
        match channel.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail("read", e)),
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(closed_error());
        };
        match channel.write_all(bytes).and_then(|()| channel.flush()) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail("write", e)),
        }
    }

    /// Fill `buf` from the channel, or from decompressed data when compressed.
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.compressed.is_none() {
            return self.read_raw(buf);
        }
        let mut filled = 0;
        while filled < buf.len() {
            let available = match &self.compressed {
                Some(c) => c.inbox.len() - c.inbox_pos,
                None => 0,
            };
            if available == 0 {
                self.read_compressed_frame()?;
                continue;
            }
            if let Some(c) = &mut self.compressed {
                let n = available.min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&c.inbox[c.inbox_pos..c.inbox_pos + n]);
                c.inbox_pos += n;
                filled += n;
            }
        }
        Ok(())
    }

    fn read_compressed_frame(&mut self) -> Result<()> {
        let mut raw = [0u8; COMPRESSED_HEADER_SIZE];
        self.read_raw(&mut raw)?;
        let compressed_len = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]) as usize;
        let sequence = raw[3];
        let uncompressed_len = u32::from_le_bytes([raw[4], raw[5], raw[6], 0]) as usize;

        let expected = self.compressed.as_ref().map_or(0, |c| c.sequence);
        if sequence != expected {
            return Err(self.desync(format!(
                "compressed sequence {sequence} does not match expected {expected}"
            )));
        }

        let mut body = vec![0u8; compressed_len];
        self.read_raw(&mut body)?;

        let data = if uncompressed_len == 0 {
            body
        } else {
            let mut out = Vec::with_capacity(uncompressed_len);
            if let Err(e) = ZlibDecoder::new(&body[..]).read_to_end(&mut out) {
                return Err(self.desync(format!("corrupt compressed packet: {e}")));
            }
            if out.len() != uncompressed_len {
                return Err(self.desync(format!(
                    "compressed packet inflated to {} bytes, header says {uncompressed_len}",
                    out.len()
                )));
            }
            out
        };
        tracing::trace!(
            seq = sequence,
            compressed_len,
            uncompressed_len,
            "read compressed frame"
        );

        if let Some(c) = &mut self.compressed {
            c.sequence = sequence.wrapping_add(1);
            c.inbox.drain(..c.inbox_pos);
            c.inbox_pos = 0;
            c.inbox.extend_from_slice(&data);
        }
        Ok(())
    }

    fn write_compressed(&mut self, framed: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(framed.len() + COMPRESSED_HEADER_SIZE);
        let mut sequence = self.compressed.as_ref().map_or(0, |c| c.sequence);
        for chunk in framed.chunks(self.max_chunk) {
            let (body, uncompressed_len) = if chunk.len() < MIN_COMPRESS_LENGTH {
                (None, 0)
            } else {
                match deflate(chunk) {
                    Ok(deflated) if deflated.len() < chunk.len() => (Some(deflated), chunk.len()),
                    Ok(_) => (None, 0),
                    Err(e) => return Err(self.fail("compress", e)),
                }
            };
            let body = body.as_deref().unwrap_or(chunk);
            out.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
            out.push(sequence);
            out.extend_from_slice(&(uncompressed_len as u32).to_le_bytes()[..3]);
            out.extend_from_slice(body);
            sequence = sequence.wrapping_add(1);
        }
        if let Some(c) = &mut self.compressed {
            c.sequence = sequence;
        }
        self.write_raw(&out)
    }
}

fn deflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn closed_error() -> Error {
    Error::Transport(TransportError::new(
        TransportErrorKind::Closed,
        "transport is closed",
    ))
}
