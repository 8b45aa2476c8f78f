//! Fixed-capacity message buffers for the length-prefixed wire protocol.
//!
//! Every message on the wire is framed as:
//!
//! ```text
//! [2 bytes length, little-endian]  -- byte count of everything that follows
//! [4 bytes checksum/sequence]      -- present unless the legacy-length exception applies
//! [variable payload]
//! ```
//!
//! [`NetworkMessage`] is the inbound body buffer with a read cursor;
//! [`OutputMessage`] is the outbound builder whose header is written only when
//! the bytes are handed to the socket.

use thiserror::Error;

/// Hard capacity of a message buffer, header included.
pub const NETWORK_MESSAGE_CAPACITY: usize = 24_590;

/// Size of the length header on the wire.
pub const HEADER_LENGTH: usize = 2;

/// Size of the checksum/sequence slot at the front of a body.
pub const CHECKSUM_LENGTH: usize = 4;

/// Slack reserved below the hard capacity so a reply envelope always fits.
const PROTOCOL_SLACK: usize = 16;

/// Largest body length a header may declare. Zero, or anything above this,
/// is a fatal framing error before any body byte is read.
pub const MAX_BODY_LENGTH: usize = NETWORK_MESSAGE_CAPACITY - HEADER_LENGTH - PROTOCOL_SLACK;

/// Exact body length that very old clients use for their first probe; such a
/// message never carries a checksum slot.
pub const LEGACY_PROBE_LENGTH: usize = 10;

/// Bodies shorter than this cannot carry the 4-byte slot plus an identifier
/// byte and are treated as legacy, checksum-free payloads.
pub const LEGACY_BARE_THRESHOLD: usize = 6;

/// Returns whether a body of `len` bytes carries the checksum/sequence slot.
///
/// Old clients omit the slot entirely; the only way to tell is this length
/// heuristic, so both thresholds must stay stable across releases.
pub fn checksum_slot_present(len: usize) -> bool {
    len != LEGACY_PROBE_LENGTH && len >= LEGACY_BARE_THRESHOLD
}

/// Adler-32 over `data`, the checksum stamped into the slot.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Framing-level failures. Fatal to the connection that produced them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The length header declared zero or a body at/above [`MAX_BODY_LENGTH`].
    #[error("declared body length {0} outside 1..={MAX_BODY_LENGTH}")]
    BadLength(usize),

    /// A get/peek ran past the end of the buffered body.
    #[error("read past the end of the message body")]
    Underrun,

    /// A put would exceed the buffer capacity.
    #[error("message buffer capacity exceeded")]
    Overrun,

    /// The checksum slot did not match the body contents.
    #[error("checksum mismatch (expected {expected:#010x}, got {got:#010x})")]
    ChecksumMismatch { expected: u32, got: u32 },
}

/// Inbound message body with a read/write cursor.
///
/// Pure data structure: no concurrency, no I/O. All accessors return
/// [`FramingError`] instead of panicking so a hostile peer can never take the
/// process down through a short or oversized body.
#[derive(Debug, Clone, Default)]
pub struct NetworkMessage {
    buf: Vec<u8>,
    pos: usize,
}

impl NetworkMessage {
    /// Empty message, used as a write target.
    pub fn new() -> Self {
        Self { buf: Vec::new(), pos: 0 }
    }

    /// Wraps a received body. The declared length must already have been
    /// validated against [`MAX_BODY_LENGTH`] by the framing layer.
    pub fn from_body(body: Vec<u8>) -> Self {
        Self { buf: body, pos: 0 }
    }

    /// Total body length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes left between the read cursor and the end of the body.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Unread portion of the body.
    pub fn remaining_bytes(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Entire body, cursor position ignored.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn take(&mut self, n: usize) -> Result<&[u8], FramingError> {
        if self.remaining() < n {
            return Err(FramingError::Underrun);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    /// Advances the cursor by `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), FramingError> {
        self.take(n).map(|_| ())
    }

    pub fn get_u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, FramingError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, FramingError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, FramingError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads `n` raw bytes.
    pub fn get_bytes(&mut self, n: usize) -> Result<&[u8], FramingError> {
        self.take(n)
    }

    /// Reads a u16-length-prefixed string.
    pub fn get_string(&mut self) -> Result<String, FramingError> {
        let len = self.get_u16()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Reads the next u32 without moving the cursor.
    pub fn peek_u32(&self) -> Result<u32, FramingError> {
        if self.remaining() < 4 {
            return Err(FramingError::Underrun);
        }
        let b = &self.buf[self.pos..self.pos + 4];
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consumes the 4-byte checksum/sequence slot, validating it against the
    /// rest of the body when `validate` is set.
    pub fn consume_checksum_slot(&mut self, validate: bool) -> Result<u32, FramingError> {
        let got = self.get_u32()?;
        if validate {
            let expected = adler32(self.remaining_bytes());
            if got != expected {
                return Err(FramingError::ChecksumMismatch { expected, got });
            }
        }
        Ok(got)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        if self.buf.len() + bytes.len() > NETWORK_MESSAGE_CAPACITY - HEADER_LENGTH {
            return Err(FramingError::Overrun);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), FramingError> {
        self.put(&[v])
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), FramingError> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), FramingError> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), FramingError> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.put(bytes)
    }

    /// Writes a u16-length-prefixed string.
    pub fn put_string(&mut self, s: &str) -> Result<(), FramingError> {
        let len = u16::try_from(s.len()).map_err(|_| FramingError::Overrun)?;
        self.put_u16(len)?;
        self.put(s.as_bytes())
    }
}

/// Outbound message whose envelope is assembled only at write time.
///
/// Ownership transfers into the per-connection write queue via
/// [`Connection::send_message`](crate::connection::Connection::send_message);
/// the length header (and checksum slot, when the session uses one) is stamped
/// by the writer just before the bytes hit the socket.
#[derive(Debug, Clone, Default)]
pub struct OutputMessage {
    body: NetworkMessage,
}

impl OutputMessage {
    pub fn new() -> Self {
        Self { body: NetworkMessage::new() }
    }

    /// Payload length, envelope excluded.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), FramingError> {
        self.body.put_u8(v)
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), FramingError> {
        self.body.put_u16(v)
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), FramingError> {
        self.body.put_u32(v)
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), FramingError> {
        self.body.put_u64(v)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.body.put_bytes(bytes)
    }

    pub fn put_string(&mut self, s: &str) -> Result<(), FramingError> {
        self.body.put_string(s)
    }

    /// Assembles the wire frame: length header, optional checksum slot,
    /// payload. `with_slot` mirrors what the peer negotiated at first message.
    pub fn frame(&self, with_slot: bool) -> Vec<u8> {
        let payload = self.body.as_bytes();
        let slot = if with_slot { CHECKSUM_LENGTH } else { 0 };
        let total = payload.len() + slot;
        let mut out = Vec::with_capacity(HEADER_LENGTH + total);
        out.extend_from_slice(&(total as u16).to_le_bytes());
        if with_slot {
            out.extend_from_slice(&adler32(payload).to_le_bytes());
        }
        out.extend_from_slice(payload);
        out
    }
}
