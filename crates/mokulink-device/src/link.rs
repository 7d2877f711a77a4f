use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mokulink_transport::{
    DatalogStatus, DeviceStream, FramePayload, RegisterTransaction, RegisterWord, Transport,
    TransportError,
};
use mokulink_wire::{
    Packet, PacketError, PacketReader, PacketWriter, CONTROL, DATA, DATALOG, ERROR, REGISTERS,
};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::control::{ControlMessage, PropertiesReply, CONTROL_DEPLOY, CONTROL_PROPERTIES};
use crate::datalog;
use crate::deploy::{DeployRequest, DeployResponse, DeployResult};
use crate::error::{DeviceError, Result};
use crate::registers;

/// A connected instrument.
///
/// Requests are strictly one at a time: each sends one packet and waits for
/// the reply on the same channel. Frame payloads that arrive meanwhile are
/// kept, with their receive time, for the next
/// [`Transport::read_frame_payload`].
pub struct DeviceLink {
    reader: PacketReader<DeviceStream>,
    writer: PacketWriter<DeviceStream>,
    config: LinkConfig,
    frames: VecDeque<FramePayload>,
    seq: u8,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl DeviceLink {
    /// Wrap a connected stream.
    pub fn from_stream(stream: DeviceStream, config: LinkConfig) -> Result<Self> {
        let peer = stream.peer_addr().ok();
        let reader_stream = stream.try_clone()?;

        let reader = PacketReader::with_limit(reader_stream, config.max_payload_size);
        let mut writer = PacketWriter::with_limit(stream, config.max_payload_size);
        writer.set_write_timeout(Some(config.request_timeout))?;

        Ok(Self {
            reader,
            writer,
            config,
            frames: VecDeque::new(),
            seq: 0,
            peer,
            closed: false,
        })
    }

    /// Link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Address of the device, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Frame payloads received while waiting for replies and not yet read.
    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    /// Load an instrument and wait until the device reports it running.
    pub fn deploy_instrument(&mut self, instrument_id: u8) -> Result<DeployResult> {
        let request = DeployRequest::new(&self.config, instrument_id)?;
        let msg = ControlMessage::with_payload(CONTROL_DEPLOY, &request)?;
        let reply = self.request(CONTROL, &msg.to_bytes()?, self.config.deploy_timeout)?;
        let response: DeployResponse =
            ControlMessage::from_bytes(&reply)?.into_payload(CONTROL_DEPLOY)?;
        let result = request.accept(response)?;

        // Anything buffered so far was produced by the previous instrument.
        self.frames.clear();
        info!(
            instrument = instrument_id,
            bitstream = result.bitstream_version,
            "instrument deployed"
        );
        Ok(result)
    }

    /// One request, one acknowledgement: the device applies the register
    /// words and the datalogger mode together or not at all.
    fn write_registers(&mut self, txn: &RegisterTransaction) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let payload = registers::encode_write(txn)?;
        let reply = self.request(REGISTERS, &payload, self.config.request_timeout)?;
        registers::decode_write_ack(&reply)?;
        debug!(
            state_id = txn.state_id,
            words = txn.writes.len(),
            datalog = ?txn.datalog,
            "register transaction acknowledged"
        );
        Ok(())
    }

    fn read_register_words(&mut self, addresses: &[u8]) -> Result<Vec<RegisterWord>> {
        let mut words = Vec::with_capacity(addresses.len());
        for chunk in addresses.chunks(u8::MAX as usize) {
            let payload = registers::encode_read(chunk)?;
            let reply = self.request(REGISTERS, &payload, self.config.request_timeout)?;
            words.extend(registers::decode_read_reply(&reply, chunk)?);
        }
        Ok(words)
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<FramePayload>> {
        self.ensure_open()?;
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }

        let deadline = Instant::now() + timeout;
        while let Some(packet) = self.recv_before(deadline)? {
            match packet.channel {
                DATA => return Ok(Some(FramePayload::now(packet.payload))),
                ERROR => return Err(device_error(&packet)),
                other => warn!(channel = other, "dropping reply with no pending request"),
            }
        }
        Ok(None)
    }

    fn read_properties(&mut self, section: &str) -> Result<Vec<(String, String)>> {
        let msg = ControlMessage::properties(section);
        let reply = self.request(CONTROL, &msg.to_bytes()?, self.config.request_timeout)?;
        let reply: PropertiesReply =
            ControlMessage::from_bytes(&reply)?.into_payload(CONTROL_PROPERTIES)?;
        if reply.status != 0 {
            return Err(DeviceError::Rejected {
                operation: "properties",
                code: reply.status,
            });
        }
        debug!(section, count = reply.entries.len(), "properties read");
        Ok(reply.entries)
    }

    fn query_datalog(&mut self) -> Result<DatalogStatus> {
        let seq = self.next_seq();
        let reply = self.request(
            DATALOG,
            &datalog::encode_status(seq),
            self.config.request_timeout,
        )?;
        datalog::decode_status(&reply, seq)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let notify = ControlMessage::close()
            .to_bytes()
            .and_then(|bytes| Ok(self.writer.send(CONTROL, &bytes)?));
        if let Err(err) = notify {
            debug!(error = %err, "close notification not delivered");
        }
        self.closed = true;
        self.frames.clear();
        self.writer.get_ref().shutdown()?;
        info!(peer = ?self.peer, "device link closed");
        Ok(())
    }

    /// Send one request and wait for the reply on the same channel.
    fn request(&mut self, channel: u16, payload: &[u8], timeout: Duration) -> Result<Bytes> {
        self.ensure_open()?;
        if let Err(err) = self.writer.send(channel, payload) {
            return Err(self.packet_failure(err));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let Some(packet) = self.recv_before(deadline)? else {
                return Err(DeviceError::Timeout(timeout));
            };
            match packet.channel {
                c if c == channel => return Ok(packet.payload),
                DATA => self.buffer_frame(FramePayload::now(packet.payload)),
                ERROR => return Err(device_error(&packet)),
                other => warn!(
                    channel = other,
                    expected = channel,
                    "dropping reply with no pending request"
                ),
            }
        }
    }

    fn recv_before(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        let received = self.reader.read_before(deadline);
        received.map_err(|err| self.packet_failure(err))
    }

    fn buffer_frame(&mut self, frame: FramePayload) {
        self.frames.push_back(frame);
        if self.frames.len() > self.config.max_pending_frames {
            self.frames.pop_front();
            debug!("dropping oldest buffered frame");
        }
    }

    fn packet_failure(&mut self, err: PacketError) -> DeviceError {
        match err {
            PacketError::ConnectionClosed => {
                self.closed = true;
                DeviceError::Disconnected("device closed the connection".to_string())
            }
            other => {
                if let PacketError::Io(io) = &other {
                    if TransportError::Io(std::io::Error::from(io.kind())).is_terminal() {
                        self.closed = true;
                    }
                }
                DeviceError::Packet(other)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DeviceError::Transport(TransportError::Closed));
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }
}

/// ERROR packets carry a status byte followed by a UTF-8 message.
fn device_error(packet: &Packet) -> DeviceError {
    let (code, message) = match packet.payload.split_first() {
        Some((&code, rest)) => (code, String::from_utf8_lossy(rest).into_owned()),
        None => (0, String::new()),
    };
    warn!(code, %message, "device reported an error");
    DeviceError::Device { code, message }
}

impl Transport for DeviceLink {
    fn deploy(&mut self, instrument_id: u8) -> mokulink_transport::Result<u16> {
        Ok(self.deploy_instrument(instrument_id)?.bitstream_version)
    }

    fn write_transaction(&mut self, txn: &RegisterTransaction) -> mokulink_transport::Result<()> {
        self.write_registers(txn).map_err(Into::into)
    }

    fn read_registers(&mut self, addresses: &[u8]) -> mokulink_transport::Result<Vec<RegisterWord>> {
        self.read_register_words(addresses).map_err(Into::into)
    }

    fn read_frame_payload(
        &mut self,
        timeout: Duration,
    ) -> mokulink_transport::Result<Option<FramePayload>> {
        self.next_frame(timeout).map_err(Into::into)
    }

    fn properties(&mut self, section: &str) -> mokulink_transport::Result<Vec<(String, String)>> {
        self.read_properties(section).map_err(Into::into)
    }

    fn datalog_status(&mut self) -> mokulink_transport::Result<DatalogStatus> {
        self.query_datalog().map_err(Into::into)
    }

    fn close(&mut self) -> mokulink_transport::Result<()> {
        self.shutdown().map_err(Into::into)
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("peer", &self.peer)
            .field("buffered_frames", &self.frames.len())
            .field("closed", &self.closed)
            .finish()
    }
}
