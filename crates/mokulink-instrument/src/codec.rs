//! Frame payload decoding.
//!
//! Payload layout (all integers little-endian):
//!
//! ```text
//! offset  size  field
//!      0     1  sync (0xA5)
//!      1     1  format version (1)
//!      2     2  frame id
//!      4     1  instrument id
//!      5     1  state id
//!      6     1  trigger state
//!      7     1  flags
//!      8     4  waveform id
//!     12     4  device timestamp
//!     16     2  samples per channel
//!     18     1  channel count
//!     19     1  reserved
//!     20   4*n  i32 samples, channel-major; i32::MIN marks an invalid sample
//!    end     2  additive checksum of every preceding byte
//! ```
//!
//! Decoding is a pure function of the payload and the codec's
//! [`FrameScaling`], which the session refreshes after every commit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MokuError, Result};
use crate::instrument::Channel;

pub const FRAME_SYNC: u8 = 0xA5;
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_SIZE: usize = 20;
pub const FRAME_CHECKSUM_SIZE: usize = 2;
/// Raw sample value the device uses for "no data at this point".
pub const INVALID_SAMPLE: i32 = i32::MIN;
/// Upper bound on samples per channel in one frame.
pub const DEFAULT_MAX_SAMPLES: usize = 1 << 14;

/// How raw samples map to physical units for the attached instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameScaling {
    pub instrument_id: u8,
    /// Volts per raw count, one entry per channel carried in the frame.
    pub channel_scales: Vec<f64>,
    /// Configured frame rate, in frames per second.
    pub framerate: f64,
    pub max_samples: usize,
}

impl FrameScaling {
    pub fn new(instrument_id: u8, channel_scales: Vec<f64>) -> Self {
        Self {
            instrument_id,
            channel_scales,
            framerate: 0.0,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    pub fn with_framerate(mut self, framerate: f64) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }
}

/// Fixed-size frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub frame_id: u16,
    pub instrument_id: u8,
    pub state_id: u8,
    pub trigger_state: u8,
    pub flags: u8,
    pub waveform_id: u32,
    pub timestamp: u32,
}

/// One decoded snapshot of channel data.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub header: FrameHeader,
    pub framerate: f64,
    /// Volts per raw count used for `channels`.
    pub scales: Vec<f64>,
    /// Raw samples per channel; `None` where the device marked no data.
    pub raw: Vec<Vec<Option<i32>>>,
    /// Scaled samples per channel.
    pub channels: Vec<Vec<Option<f64>>>,
}

impl DataFrame {
    pub fn channel(&self, channel: Channel) -> Option<&[Option<f64>]> {
        self.channels.get(channel.index()).map(Vec::as_slice)
    }

    pub fn raw_channel(&self, channel: Channel) -> Option<&[Option<i32>]> {
        self.raw.get(channel.index()).map(Vec::as_slice)
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn trigger_state(&self) -> u8 {
        self.header.trigger_state
    }

    pub fn samples_per_channel(&self) -> usize {
        self.raw.first().map_or(0, Vec::len)
    }
}

/// Stateless decoder parameterized by the attached instrument's scaling.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    scaling: FrameScaling,
}

fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

fn malformed(msg: impl Into<String>) -> MokuError {
    MokuError::Stream(msg.into())
}

impl FrameCodec {
    pub fn new(scaling: FrameScaling) -> Self {
        Self { scaling }
    }

    pub fn scaling(&self) -> &FrameScaling {
        &self.scaling
    }

    pub fn set_scaling(&mut self, scaling: FrameScaling) {
        self.scaling = scaling;
    }

    pub fn decode(&self, payload: &[u8]) -> Result<DataFrame> {
        if payload.len() < FRAME_HEADER_SIZE + FRAME_CHECKSUM_SIZE {
            return Err(malformed(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }
        if payload[0] != FRAME_SYNC {
            return Err(malformed(format!("bad sync byte {:#04x}", payload[0])));
        }
        if payload[1] != FRAME_VERSION {
            return Err(malformed(format!(
                "unsupported frame format version {}",
                payload[1]
            )));
        }

        let (body, trailer) = payload.split_at(payload.len() - FRAME_CHECKSUM_SIZE);
        let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
        let actual = checksum(body);
        if expected != actual {
            return Err(malformed(format!(
                "checksum mismatch: frame says {expected:#06x}, computed {actual:#06x}"
            )));
        }

        let mut buf = &body[2..];
        let header = FrameHeader {
            frame_id: buf.get_u16_le(),
            instrument_id: buf.get_u8(),
            state_id: buf.get_u8(),
            trigger_state: buf.get_u8(),
            flags: buf.get_u8(),
            waveform_id: buf.get_u32_le(),
            timestamp: buf.get_u32_le(),
        };
        let samples = usize::from(buf.get_u16_le());
        let channel_count = usize::from(buf.get_u8());
        buf.advance(1);

        if header.instrument_id != self.scaling.instrument_id {
            return Err(malformed(format!(
                "frame from instrument {}, expected {}",
                header.instrument_id, self.scaling.instrument_id
            )));
        }
        if channel_count != self.scaling.channel_scales.len() {
            return Err(malformed(format!(
                "frame carries {channel_count} channels, expected {}",
                self.scaling.channel_scales.len()
            )));
        }
        if samples > self.scaling.max_samples {
            return Err(malformed(format!(
                "{samples} samples per channel exceeds {}",
                self.scaling.max_samples
            )));
        }
        let needed = channel_count * samples * 4;
        if buf.remaining() != needed {
            return Err(malformed(format!(
                "sample block is {} bytes, header implies {needed}",
                buf.remaining()
            )));
        }

        let mut raw = Vec::with_capacity(channel_count);
        let mut channels = Vec::with_capacity(channel_count);
        for &scale in &self.scaling.channel_scales {
            let points: Vec<Option<i32>> = (0..samples)
                .map(|_| Some(buf.get_i32_le()).filter(|&s| s != INVALID_SAMPLE))
                .collect();
            channels.push(
                points
                    .iter()
                    .map(|p| p.map(|s| f64::from(s) * scale))
                    .collect(),
            );
            raw.push(points);
        }

        Ok(DataFrame {
            header,
            framerate: self.scaling.framerate,
            scales: self.scaling.channel_scales.clone(),
            raw,
            channels,
        })
    }
}

/// Lay out a frame payload the way the device sends it. Every channel must
/// carry the same number of samples.
pub fn encode_frame(header: &FrameHeader, channels: &[Vec<Option<i32>>]) -> Result<Bytes> {
    let samples = channels.first().map_or(0, Vec::len);
    if channels.iter().any(|c| c.len() != samples) {
        return Err(MokuError::invalid("channels differ in length"));
    }
    let samples = u16::try_from(samples)
        .map_err(|_| MokuError::out_of_range(format!("{samples} samples per channel")))?;
    let channel_count = u8::try_from(channels.len())
        .map_err(|_| MokuError::out_of_range(format!("{} channels", channels.len())))?;

    let mut buf = BytesMut::with_capacity(
        FRAME_HEADER_SIZE + channels.len() * usize::from(samples) * 4 + FRAME_CHECKSUM_SIZE,
    );
    buf.put_u8(FRAME_SYNC);
    buf.put_u8(FRAME_VERSION);
    buf.put_u16_le(header.frame_id);
    buf.put_u8(header.instrument_id);
    buf.put_u8(header.state_id);
    buf.put_u8(header.trigger_state);
    buf.put_u8(header.flags);
    buf.put_u32_le(header.waveform_id);
    buf.put_u32_le(header.timestamp);
    buf.put_u16_le(samples);
    buf.put_u8(channel_count);
    buf.put_u8(0);
    for channel in channels {
        for sample in channel {
            buf.put_i32_le(sample.unwrap_or(INVALID_SAMPLE));
        }
    }
    let sum = checksum(&buf);
    buf.put_u16_le(sum);
    Ok(buf.freeze())
}
