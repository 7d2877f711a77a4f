//! Packet layout on the device link.
//!
//! ```text
//! offset  size  field
//! 0       2     magic "MK"
//! 2       4     payload length, u32 LE
//! 6       2     channel id, u16 LE
//! 8       n     payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PacketError, Result};

pub const HEADER_SIZE: usize = 8;

pub const MAGIC: [u8; 2] = *b"MK";

/// Largest payload accepted by default. A full-length frame is a few tens
/// of KiB, so anything near this is a desynchronized stream.
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// One packet on the device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Append header and payload to `dst`.
    pub fn write_to(channel: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let header = PacketHeader::for_payload(channel, payload.len())?;
        dst.reserve(HEADER_SIZE + payload.len());
        header.put(dst);
        dst.put_slice(payload);
        Ok(())
    }
}

/// The fixed-size prefix of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel: u16,
    pub len: usize,
}

impl PacketHeader {
    pub fn for_payload(channel: u16, len: usize) -> Result<Self> {
        if u32::try_from(len).is_err() {
            return Err(PacketError::PayloadTooLarge {
                size: len,
                max: u32::MAX as usize,
            });
        }
        Ok(Self { channel, len })
    }

    fn put(self, dst: &mut BytesMut) {
        dst.put_slice(&MAGIC);
        dst.put_u32_le(self.len as u32);
        dst.put_u16_le(self.channel);
    }

    /// Parse a header from the start of `src` without consuming it.
    /// `Ok(None)` means fewer than [`HEADER_SIZE`] bytes are available.
    pub fn peek(mut src: &[u8]) -> Result<Option<Self>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        if src[..2] != MAGIC {
            return Err(PacketError::InvalidMagic);
        }
        src.advance(2);
        let len = src.get_u32_le() as usize;
        let channel = src.get_u16_le();
        Ok(Some(Self { channel, len }))
    }
}

/// Reassembles packets from bytes that arrive in arbitrary pieces.
///
/// Bytes stay buffered across calls, so a read that times out halfway
/// through a packet loses nothing.
#[derive(Debug)]
pub struct PacketDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl PacketDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete packet out of the buffer, if there is one.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        let Some(header) = PacketHeader::peek(&self.buf)? else {
            return Ok(None);
        };
        if header.len > self.max_payload {
            return Err(PacketError::PayloadTooLarge {
                size: header.len,
                max: self.max_payload,
            });
        }
        if self.buf.len() < HEADER_SIZE + header.len {
            return Ok(None);
        }
        self.buf.advance(HEADER_SIZE);
        let payload = self.buf.split_to(header.len).freeze();
        Ok(Some(Packet {
            channel: header.channel,
            payload,
        }))
    }

    /// Bytes received but not yet returned as a packet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
