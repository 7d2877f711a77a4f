//! The capability interface shared by every instrument, plus the analog
//! front end both instruments expose.

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::codec::FrameScaling;
use crate::error::{MokuError, Result};
use crate::shadow::ShadowState;

/// An instrument that can be deployed and driven through a session.
///
/// Implementors own their [`ShadowState`]; all `set_*` and `synth_*`
/// operations only stage into it. The session's commit engine is the sole
/// path that writes to the device.
pub trait Instrument: Send + 'static {
    /// Bitstream id deployed on the device.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn shadow(&self) -> &ShadowState;

    fn shadow_mut(&mut self) -> &mut ShadowState;

    /// Stage the instrument's power-on configuration.
    fn set_defaults(&mut self) -> Result<()>;

    /// Scaling the frame codec should use for the committed configuration.
    fn frame_scaling(&self) -> FrameScaling;

    /// Whether the device streams data frames while this instrument runs.
    fn streams_frames(&self) -> bool {
        true
    }

    /// Called once the instrument is deployed, before any defaults are
    /// staged.
    fn attach(&mut self, _context: &AttachContext) {}

    /// Last chance to restage fields derived from other staged fields,
    /// right before the commit snapshot. An error aborts the commit with
    /// nothing sent.
    fn before_commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Device facts handed to an instrument when it is attached.
#[derive(Debug, Clone, Default)]
pub struct AttachContext {
    pub calibration: Calibration,
    /// Highest sample rate at which the device can log to its own storage.
    pub datalog_rate_threshold: f64,
}

/// Input or output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Ch1,
    Ch2,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Ch1, Channel::Ch2];

    /// Zero-based index.
    pub fn index(self) -> usize {
        match self {
            Channel::Ch1 => 0,
            Channel::Ch2 => 1,
        }
    }

    pub fn other(self) -> Channel {
        match self {
            Channel::Ch1 => Channel::Ch2,
            Channel::Ch2 => Channel::Ch1,
        }
    }

    /// Choose the per-channel variant of a field name.
    pub(crate) fn pick(self, ch1: &'static str, ch2: &'static str) -> &'static str {
        match self {
            Channel::Ch1 => ch1,
            Channel::Ch2 => ch2,
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = MokuError;

    fn try_from(number: u8) -> Result<Self> {
        match number {
            1 => Ok(Channel::Ch1),
            2 => Ok(Channel::Ch2),
            n => Err(MokuError::out_of_range(format!("no channel {n}"))),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.index() + 1)
    }
}

const RELAY_DC: u64 = 1;
const RELAY_LOWZ: u64 = 2;
const RELAY_LOWG: u64 = 4;

/// Termination, gain and coupling of one analog input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontendConfig {
    /// 50 Ω termination instead of 1 MΩ.
    pub fifty_ohm: bool,
    /// 10x attenuation, widening the range from 1 Vpp to 10 Vpp.
    pub attenuate: bool,
    pub ac_coupled: bool,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            fifty_ohm: false,
            attenuate: true,
            ac_coupled: false,
        }
    }
}

impl FrontendConfig {
    /// Relay bits as the device expects them.
    pub fn relays(self) -> u64 {
        let mut relays = 0;
        if self.fifty_ohm {
            relays |= RELAY_LOWZ;
        }
        if self.attenuate {
            relays |= RELAY_LOWG;
        }
        if !self.ac_coupled {
            relays |= RELAY_DC;
        }
        relays
    }

    pub fn from_relays(relays: u64) -> Self {
        Self {
            fifty_ohm: relays & RELAY_LOWZ != 0,
            attenuate: relays & RELAY_LOWG != 0,
            ac_coupled: relays & RELAY_DC == 0,
        }
    }

    /// Largest input magnitude in volts.
    pub fn input_range(self) -> f64 {
        if self.attenuate {
            5.0
        } else {
            0.5
        }
    }

    /// Key of the device calibration entry for this front-end setting.
    pub fn calibration_key(self) -> String {
        format!(
            "AG-{}-{}-{}-1",
            if self.fifty_ohm { "50" } else { "1M" },
            if self.attenuate { "L" } else { "H" },
            if self.ac_coupled { "A" } else { "D" },
        )
    }
}

/// Analog front-end control, available on every instrument.
pub trait Frontend: Instrument {
    fn set_frontend(&mut self, channel: Channel, config: FrontendConfig) -> Result<()> {
        self.shadow_mut()
            .stage_raw(channel.pick("relays_ch1", "relays_ch2"), config.relays())
    }

    fn frontend(&self, channel: Channel) -> Result<FrontendConfig> {
        let relays = self
            .shadow()
            .read_raw(channel.pick("relays_ch1", "relays_ch2"))?;
        Ok(FrontendConfig::from_relays(relays))
    }
}

impl<T: Instrument + ?Sized> Frontend for T {}

/// Per-device calibration constants, read from the `calibration` property
/// section on attach.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calibration {
    values: HashMap<String, f64>,
}

impl Calibration {
    /// Build from `calibration.<key> = <value>` property entries. Entries
    /// that do not parse are skipped with a warning.
    pub fn from_properties(entries: &[(String, String)]) -> Self {
        let mut values = HashMap::new();
        for (key, value) in entries {
            let key = key.strip_prefix("calibration.").unwrap_or(key);
            match value.trim().parse::<f64>() {
                Ok(v) if v.is_finite() && v != 0.0 => {
                    values.insert(key.to_string(), v);
                }
                _ => warn!(key, value = %value, "ignoring unusable calibration entry"),
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Volts per ADC bit for an input with the given front end, or unity when
    /// the device carries no calibration for it.
    pub fn input_gain(&self, frontend: FrontendConfig) -> f64 {
        self.get(&frontend.calibration_key())
            .map_or(1.0, |cal| 1.0 / cal)
    }
}
