use std::io::{ErrorKind, Write};
use std::time::Duration;

use bytes::BytesMut;
use mokulink_transport::DeviceStream;

use crate::codec::{Packet, DEFAULT_MAX_PAYLOAD};
use crate::error::{PacketError, Result};
use crate::reader::transport_to_packet_error;

/// Sends whole packets. Each packet goes out in one `write_all`, so the
/// device never sees two packets interleaved.
pub struct PacketWriter<T> {
    inner: T,
    buf: BytesMut,
    max_payload: usize,
}

impl<T: Write> PacketWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_limit(inner, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_limit(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            max_payload,
        }
    }

    pub fn send(&mut self, channel: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(PacketError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        self.buf.clear();
        Packet::write_to(channel, payload, &mut self.buf)?;
        self.inner
            .write_all(&self.buf)
            .and_then(|()| self.inner.flush())
            .map_err(|err| match err.kind() {
                ErrorKind::WriteZero => PacketError::ConnectionClosed,
                _ => PacketError::Io(err),
            })
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl PacketWriter<DeviceStream> {
    /// Bound how long one `send` may block on a stalled device.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_write_timeout(timeout)
            .map_err(transport_to_packet_error)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::PacketDecoder;

    #[test]
    fn sent_packet_decodes() {
        let mut writer = PacketWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(1, b"regs").unwrap();
        writer.send(3, b"").unwrap();

        let mut decoder = PacketDecoder::new(DEFAULT_MAX_PAYLOAD);
        decoder.extend(writer.get_ref().get_ref());
        assert_eq!(decoder.next_packet().unwrap(), Some(Packet::new(1, "regs")));
        assert_eq!(decoder.next_packet().unwrap(), Some(Packet::new(3, "")));
    }

    #[test]
    fn payload_over_limit_is_not_written() {
        let mut writer = PacketWriter::with_limit(Cursor::new(Vec::<u8>::new()), 4);
        let err = writer.send(1, b"oversized").unwrap_err();
        assert!(matches!(err, PacketError::PayloadTooLarge { size: 9, max: 4 }));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn stream_that_stops_accepting_bytes_is_closed() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = PacketWriter::new(Full).send(1, b"x").unwrap_err();
        assert!(matches!(err, PacketError::ConnectionClosed));
    }
}
