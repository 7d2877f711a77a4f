use std::io::{ErrorKind, Read};
use std::time::Instant;

use mokulink_transport::{DeviceStream, TransportError};

use crate::codec::{Packet, PacketDecoder, DEFAULT_MAX_PAYLOAD};
use crate::error::{PacketError, Result};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Reads complete packets from any `Read` stream.
///
/// Partial packets stay buffered across read errors, so a timed-out read can
/// simply be retried.
pub struct PacketReader<T> {
    inner: T,
    decoder: PacketDecoder,
}

impl<T: Read> PacketReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_limit(inner, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_limit(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            decoder: PacketDecoder::new(max_payload),
        }
    }

    /// Read the next complete packet, blocking as the stream allows.
    ///
    /// Returns `Err(PacketError::ConnectionClosed)` at EOF.
    pub fn read_packet(&mut self) -> Result<Packet> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(packet) = self.decoder.next_packet()? {
                tracing::trace!(
                    channel = packet.channel,
                    len = packet.payload.len(),
                    "packet received"
                );
                return Ok(packet);
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(PacketError::ConnectionClosed),
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(PacketError::Io(err)),
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }
}

impl PacketReader<DeviceStream> {
    /// Wait for the next packet until `deadline`. `Ok(None)` means the
    /// deadline passed first; whatever part of a packet had arrived is kept
    /// for the next call.
    pub fn read_before(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        if let Some(packet) = self.decoder.next_packet()? {
            return Ok(Some(packet));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        self.inner
            .set_read_timeout(Some(remaining))
            .map_err(transport_to_packet_error)?;
        match self.read_packet() {
            Ok(packet) => Ok(Some(packet)),
            Err(err) if err.is_timeout() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub(crate) fn transport_to_packet_error(err: TransportError) -> PacketError {
    match err {
        TransportError::Io(io) => PacketError::Io(io),
        TransportError::Connect { source, .. } => PacketError::Io(source),
        other => PacketError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use bytes::BytesMut;

    use super::*;
    use crate::writer::PacketWriter;

    fn wire(packets: &[(u16, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (channel, payload) in packets {
            Packet::write_to(*channel, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn stream_pair() -> (DeviceStream, DeviceStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (DeviceStream::from_tcp(client), DeviceStream::from_tcp(server))
    }

    #[test]
    fn reads_packets_in_order() {
        let bytes = wire(&[(0, b"deploy"), (1, b"regs"), (2, b"frame")]);
        let mut reader = PacketReader::new(Cursor::new(bytes));
        for (channel, payload) in [(0, "deploy"), (1, "regs"), (2, "frame")] {
            assert_eq!(reader.read_packet().unwrap(), Packet::new(channel, payload));
        }
        assert!(matches!(
            reader.read_packet(),
            Err(PacketError::ConnectionClosed)
        ));
    }

    #[test]
    fn eof_mid_packet_is_connection_closed() {
        let mut bytes = wire(&[(2, b"only-part-of-it")]);
        bytes.truncate(12);
        let mut reader = PacketReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_packet(),
            Err(PacketError::ConnectionClosed)
        ));
    }

    #[test]
    fn timeout_keeps_partial_packet() {
        struct Trickle(Vec<Option<Vec<u8>>>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() {
                    return Ok(0);
                }
                match self.0.remove(0) {
                    None => Err(std::io::Error::from(ErrorKind::WouldBlock)),
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(chunk.len())
                    }
                }
            }
        }

        let bytes = wire(&[(7, b"ok")]);
        let (head, tail) = bytes.split_at(5);
        let mut reader =
            PacketReader::new(Trickle(vec![Some(head.to_vec()), None, Some(tail.to_vec())]));

        assert!(reader.read_packet().unwrap_err().is_timeout());
        assert_eq!(reader.buffered(), 5);
        assert_eq!(reader.read_packet().unwrap(), Packet::new(7, "ok"));
    }

    #[test]
    fn read_before_returns_none_at_deadline() {
        let (client, _server) = stream_pair();
        let mut reader = PacketReader::new(client);
        let started = Instant::now();
        let packet = reader
            .read_before(started + Duration::from_millis(30))
            .unwrap();
        assert!(packet.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(reader.read_before(started).unwrap(), None);
    }

    #[test]
    fn read_before_delivers_what_is_already_buffered() {
        let (client, server) = stream_pair();
        let mut writer = PacketWriter::new(client);
        let mut reader = PacketReader::new(server);
        writer.send(1, b"ack").unwrap();
        writer.send(2, b"frame").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(reader.read_before(deadline).unwrap(), Some(Packet::new(1, "ack")));
        assert_eq!(reader.read_before(deadline).unwrap(), Some(Packet::new(2, "frame")));
    }

    #[test]
    fn writer_and_reader_on_separate_threads() {
        let (client, server) = stream_pair();
        let mut writer = PacketWriter::new(client);
        let mut reader = PacketReader::new(server);

        let reader_thread = std::thread::spawn(move || {
            for i in 0..64u16 {
                let packet = reader.read_packet().unwrap();
                assert_eq!(packet, Packet::new(i % 5, format!("msg-{i}")));
            }
        });
        for i in 0..64u16 {
            writer.send(i % 5, format!("msg-{i}").as_bytes()).unwrap();
        }
        reader_thread.join().unwrap();
    }
}
