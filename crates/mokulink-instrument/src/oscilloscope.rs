//! Two-channel oscilloscope with the embedded synthesizer outputs.
//!
//! The acquisition path samples both inputs at [`ADC_SMP_RATE`] divided by
//! the decimation rate into a [`BUFLEN`]-sample buffer, then renders that
//! buffer down to a screen-width frame. [`Oscilloscope::set_timebase`]
//! derives decimation, buffer offset and render parameters from the
//! requested window and stages them together.

use std::time::Duration;

use mokulink_transport::{DatalogCommand, DatalogSettings, DatalogStorage};
use tracing::{debug, warn};

use crate::codec::FrameScaling;
use crate::config::DEFAULT_DATALOG_RATE_THRESHOLD;
use crate::error::{MokuError, Result};
use crate::instrument::{AttachContext, Calibration, Channel, Frontend, FrontendConfig, Instrument};
use crate::register::{common_fields, RegisterField, RegisterMap};
use crate::shadow::{ShadowState, Value};
use crate::synth::{synth_fields, Synthesizer, DAC_VOLTS_PER_BIT, MAX_OUTPUT_VOLTAGE};

pub const OSCILLOSCOPE_ID: u8 = 1;

pub const REG_OSC_OUTSEL: u8 = 65;
pub const REG_OSC_TRIGMODE: u8 = 66;
pub const REG_OSC_TRIGCTL: u8 = 67;
pub const REG_OSC_TRIGLVL: u8 = 68;
pub const REG_OSC_ACTL: u8 = 69;
pub const REG_OSC_DECIMATION: u8 = 70;

pub const ADC_SMP_RATE: f64 = 500e6;
/// Samples per channel in the acquisition buffer.
pub const BUFLEN: f64 = 16_384.0;
pub const SCREEN_WIDTH: f64 = 1024.0;
pub const DEFAULT_FRAMERATE: f64 = 10.0;

const RDR_CUBIC: u64 = 0;
const AIN_DDS: u64 = 0;
const AIN_DECI: u64 = 1;
const SRC_DAC: u64 = 1;

/// Horizontal acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XMode {
    /// Each frame is a fresh triggered capture.
    FullFrame,
    /// Samples scroll continuously across the screen; required for
    /// datalogging.
    Roll,
    /// Samples sweep left to right, overwriting the previous pass.
    Sweep,
}

impl XMode {
    fn code(self) -> u64 {
        match self {
            XMode::FullFrame => 0,
            XMode::Roll => 1,
            XMode::Sweep => 2,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            1 => XMode::Roll,
            2 => XMode::Sweep,
            _ => XMode::FullFrame,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Input(Channel),
    Output(Channel),
}

impl TriggerSource {
    fn code(self) -> u64 {
        match self {
            TriggerSource::Input(Channel::Ch1) => 0,
            TriggerSource::Input(Channel::Ch2) => 1,
            TriggerSource::Output(Channel::Ch1) => 2,
            TriggerSource::Output(Channel::Ch2) => 3,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            1 => TriggerSource::Input(Channel::Ch2),
            2 => TriggerSource::Output(Channel::Ch1),
            3 => TriggerSource::Output(Channel::Ch2),
            _ => TriggerSource::Input(Channel::Ch1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    fn code(self) -> u64 {
        match self {
            Edge::Rising => 0,
            Edge::Falling => 1,
            Edge::Both => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Free-run when no trigger arrives.
    Auto,
    Normal,
    Single,
}

impl TriggerMode {
    fn code(self) -> u64 {
        match self {
            TriggerMode::Auto => 0,
            TriggerMode::Normal => 1,
            TriggerMode::Single => 2,
        }
    }
}

/// What an acquisition channel records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// The analog input of the same number.
    Adc,
    /// The synthesizer output of the same number, looped back.
    Dac,
}

fn oscilloscope_fields() -> Vec<RegisterField> {
    vec![
        RegisterField::flag("source_ch1", REG_OSC_OUTSEL, 0),
        RegisterField::flag("source_ch2", REG_OSC_OUTSEL, 1),
        RegisterField::new("trig_mode", REG_OSC_TRIGMODE, 0, 2).choices(&[0, 1, 2]),
        RegisterField::new("trig_edge", REG_OSC_TRIGCTL, 0, 2).choices(&[0, 1, 2]),
        RegisterField::new("trig_ch", REG_OSC_TRIGCTL, 4, 6).choices(&[0, 1, 2, 3]),
        RegisterField::flag("hf_reject", REG_OSC_TRIGCTL, 12),
        RegisterField::new("hysteresis", REG_OSC_TRIGCTL, 16, 16),
        RegisterField::new("trigger_level", REG_OSC_TRIGLVL, 0, 32).signed(),
        RegisterField::new("ain_mode", REG_OSC_ACTL, 16, 2).choices(&[AIN_DDS, AIN_DECI]),
        RegisterField::new("decimation_rate", REG_OSC_DECIMATION, 0, 32)
            .bounds(1.0, f64::from(u32::MAX)),
    ]
}

/// Decimation that fits `t1..t2` into the acquisition buffer.
fn optimal_decimation(t1: f64, t2: f64) -> f64 {
    (ADC_SMP_RATE * (t2 - t1).abs() / BUFLEN).ceil().max(1.0)
}

/// Buffer offset, in units of four samples, that places `t1` at the start
/// of the buffer.
fn buffer_offset(t1: f64, decimation: f64) -> f64 {
    let samples = ADC_SMP_RATE / decimation;
    (t1 * samples / 4.0)
        .ceil()
        .max(-(2f64.powi(28)))
        .min(2f64.powi(12))
        .round()
}

fn render_downsample(t1: f64, t2: f64, decimation: f64) -> f64 {
    let samples = ADC_SMP_RATE / decimation;
    let screen_rate = (SCREEN_WIDTH / (t2 - t1).abs()).min(ADC_SMP_RATE);
    (samples / screen_rate).clamp(1.0, 16.0).round()
}

fn render_offset(t1: f64, t2: f64, decimation: f64, offset: f64, render_deci: f64) -> f64 {
    let samples = ADC_SMP_RATE / decimation;
    let buffer_start = -(4.0 * offset) / samples;
    let buffer_end = buffer_start + (BUFLEN - 1.0) / samples;
    let centre = (t2 - t1).abs() / 2.0;
    let screen_span = render_deci / samples * SCREEN_WIDTH;
    let left = (centre - screen_span / 2.0)
        .min(buffer_end - screen_span)
        .max(buffer_start);
    (-left * samples).ceil()
}

/// Gain applied by the decimation filter in precision mode.
fn decimation_gain(decimation: f64) -> f64 {
    if decimation < 2f64.powi(20) {
        decimation
    } else {
        decimation / 2f64.powi(10)
    }
}

/// Oscilloscope controller.
#[derive(Debug, Clone)]
pub struct Oscilloscope {
    shadow: ShadowState,
    calibration: Calibration,
    datalog_rate_threshold: f64,
    /// Level requested by the last `set_trigger`, in volts. The raw level is
    /// re-derived from it if the front end changes before the commit.
    trigger_volts: Option<f64>,
}

impl Default for Oscilloscope {
    fn default() -> Self {
        Self::new()
    }
}

impl Oscilloscope {
    pub fn new() -> Self {
        Self {
            shadow: ShadowState::new(Self::register_map().into()),
            calibration: Calibration::default(),
            datalog_rate_threshold: DEFAULT_DATALOG_RATE_THRESHOLD,
            trigger_volts: None,
        }
    }

    pub fn register_map() -> RegisterMap {
        RegisterMap::new()
            .with_fields(common_fields())
            .with_fields(oscilloscope_fields())
            .with_fields(synth_fields())
    }

    fn staged(&self, name: &str) -> u64 {
        self.shadow.read_raw(name).unwrap_or_default()
    }

    fn committed(&self, name: &str) -> u64 {
        self.shadow.read_committed_raw(name).unwrap_or_default()
    }

    /// Volts per raw count for an acquisition channel, using `read` to look
    /// at either the staged or the committed configuration.
    fn input_scale(&self, channel: Channel, read: impl Fn(&str) -> u64) -> f64 {
        if read(channel.pick("source_ch1", "source_ch2")) == SRC_DAC {
            return DAC_VOLTS_PER_BIT;
        }
        let relays = read(channel.pick("relays_ch1", "relays_ch2"));
        let mut gain = self
            .calibration
            .input_gain(FrontendConfig::from_relays(relays));
        if read("ain_mode") == AIN_DECI {
            gain /= decimation_gain(read("decimation_rate").max(1) as f64);
        }
        gain
    }

    fn trigger_scale(&self, source: TriggerSource) -> (f64, f64) {
        match source {
            TriggerSource::Input(ch) => {
                let relays = self.staged(ch.pick("relays_ch1", "relays_ch2"));
                (
                    self.input_scale(ch, |n| self.staged(n)),
                    FrontendConfig::from_relays(relays).input_range(),
                )
            }
            TriggerSource::Output(_) => (DAC_VOLTS_PER_BIT, MAX_OUTPUT_VOLTAGE),
        }
    }

    /// Capture the window from `t1` to `t2` seconds around the trigger.
    pub fn set_timebase(&mut self, t1: f64, t2: f64) -> Result<()> {
        if !(t1.is_finite() && t2.is_finite()) || t2 <= t1 {
            return Err(MokuError::out_of_range(format!(
                "timebase start {t1} must be before end {t2}"
            )));
        }
        let decimation = optimal_decimation(t1, t2);
        let offset = buffer_offset(t1, decimation);
        let render_deci = render_downsample(t1, t2, decimation);
        let render_offset = render_offset(t1, t2, decimation, offset, render_deci);
        debug!(t1, t2, decimation, offset, render_deci, render_offset, "timebase");

        self.shadow.stage_group(&[
            ("decimation_rate", Value::Physical(decimation)),
            ("pretrigger", Value::Physical(offset)),
            ("render_mode", Value::Raw(RDR_CUBIC)),
            ("render_deci", Value::Physical(render_deci)),
            ("render_deci_alt", Value::Physical(render_deci)),
            ("render_offset", Value::Physical(render_offset)),
            ("render_offset_alt", Value::Physical(render_offset)),
        ])
    }

    /// Acquire at the nearest rate the decimator can produce.
    pub fn set_samplerate(&mut self, rate: f64) -> Result<()> {
        if !(rate > 0.0 && rate <= ADC_SMP_RATE) {
            return Err(MokuError::out_of_range(format!(
                "sample rate {rate} outside (0, {ADC_SMP_RATE}]"
            )));
        }
        let decimation = (ADC_SMP_RATE / rate).round().max(1.0);
        self.shadow.stage("decimation_rate", decimation)
    }

    /// Current sample rate in samples per second.
    pub fn samplerate(&self) -> f64 {
        ADC_SMP_RATE / self.staged("decimation_rate").max(1) as f64
    }

    pub fn set_xmode(&mut self, mode: XMode) -> Result<()> {
        self.shadow.stage_raw("x_mode", mode.code())
    }

    pub fn xmode(&self) -> XMode {
        XMode::from_code(self.staged("x_mode"))
    }

    /// Precision mode averages decimated samples instead of dropping them,
    /// trading bandwidth for resolution.
    pub fn set_precision_mode(&mut self, enable: bool) -> Result<()> {
        self.shadow
            .stage_raw("ain_mode", if enable { AIN_DECI } else { AIN_DDS })
    }

    pub fn precision_mode(&self) -> bool {
        self.staged("ain_mode") == AIN_DECI
    }

    pub fn set_framerate(&mut self, fps: f64) -> Result<()> {
        self.shadow.stage("framerate", fps)
    }

    pub fn framerate(&self) -> Result<f64> {
        self.shadow.read("framerate")
    }

    pub fn set_source(&mut self, channel: Channel, source: DataSource) -> Result<()> {
        let code = match source {
            DataSource::Adc => 0,
            DataSource::Dac => SRC_DAC,
        };
        self.shadow
            .stage_raw(channel.pick("source_ch1", "source_ch2"), code)
    }

    /// Trigger on `edge` crossings of `level` volts on `source`. The level
    /// is checked against the source's current range, and kept in volts if
    /// the source's front end is changed before the next commit.
    pub fn set_trigger(&mut self, source: TriggerSource, edge: Edge, level: f64) -> Result<()> {
        let (scale, range) = self.trigger_scale(source);
        if !level.is_finite() || level.abs() > range {
            return Err(MokuError::out_of_range(format!(
                "trigger level {level} V outside ±{range} V"
            )));
        }
        if let TriggerSource::Input(ch) = source {
            let frontend = self.staged_frontend(ch);
            if self.calibration.get(&frontend.calibration_key()).is_none() && level != 0.0 {
                warn!(
                    channel = %ch,
                    key = %frontend.calibration_key(),
                    level,
                    "no calibration for trigger source, level is staged in raw ADC counts"
                );
            }
        }
        self.shadow.stage_group(&[
            ("trig_ch", Value::Raw(source.code())),
            ("trig_edge", Value::Raw(edge.code())),
            ("trigger_level", Value::Physical((level / scale).round())),
        ])?;
        self.trigger_volts = Some(level);
        Ok(())
    }

    fn staged_frontend(&self, channel: Channel) -> FrontendConfig {
        FrontendConfig::from_relays(self.staged(channel.pick("relays_ch1", "relays_ch2")))
    }

    pub fn trigger_source(&self) -> TriggerSource {
        TriggerSource::from_code(self.staged("trig_ch"))
    }

    /// Trigger level in volts: the requested level when one was set,
    /// otherwise the staged raw level under the staged front end.
    pub fn trigger_level(&self) -> Result<f64> {
        if let Some(volts) = self.trigger_volts {
            return Ok(volts);
        }
        let (scale, _) = self.trigger_scale(self.trigger_source());
        Ok(self.shadow.read("trigger_level")? * scale)
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.shadow.stage_raw("trig_mode", mode.code())
    }

    /// Trigger hysteresis in volts, relative to the current trigger source.
    pub fn set_hysteresis(&mut self, volts: f64) -> Result<()> {
        if !(volts >= 0.0) {
            return Err(MokuError::out_of_range(format!("hysteresis {volts} V")));
        }
        let (scale, _) = self.trigger_scale(self.trigger_source());
        self.shadow.stage("hysteresis", (volts / scale).round())
    }

    pub fn set_hf_reject(&mut self, enable: bool) -> Result<()> {
        self.shadow.stage_raw("hf_reject", u64::from(enable))
    }

    /// Ask the device to log `channels` to its own storage for `duration`
    /// once the next commit lands. Only available in roll mode at low
    /// sample rates.
    pub fn datalogger_start(
        &mut self,
        duration: Duration,
        channels: [bool; 2],
        use_sd: bool,
    ) -> Result<()> {
        if self.xmode() != XMode::Roll {
            return Err(MokuError::invalid("datalogging requires roll mode"));
        }
        let rate = self.samplerate();
        if rate > self.datalog_rate_threshold {
            return Err(MokuError::invalid(format!(
                "sample rate {rate} Sa/s is above the datalogger limit of {} Sa/s",
                self.datalog_rate_threshold
            )));
        }
        if duration.is_zero() {
            return Err(MokuError::out_of_range("datalogger duration must be positive"));
        }
        if !channels.iter().any(|&c| c) {
            return Err(MokuError::out_of_range("datalogger needs at least one channel"));
        }
        self.shadow
            .stage_datalog(DatalogCommand::Start(DatalogSettings {
                duration,
                channels,
                storage: if use_sd {
                    DatalogStorage::SdCard
                } else {
                    DatalogStorage::Internal
                },
                sample_rate: rate,
            }))
    }

    pub fn datalogger_stop(&mut self) -> Result<()> {
        self.shadow.stage_datalog(DatalogCommand::Stop)
    }
}

impl Instrument for Oscilloscope {
    fn id(&self) -> u8 {
        OSCILLOSCOPE_ID
    }

    fn name(&self) -> &'static str {
        "oscilloscope"
    }

    fn shadow(&self) -> &ShadowState {
        &self.shadow
    }

    fn shadow_mut(&mut self) -> &mut ShadowState {
        &mut self.shadow
    }

    fn set_defaults(&mut self) -> Result<()> {
        self.shadow.stage_group(&[
            ("instrument_reset", Value::Raw(0)),
            ("pause", Value::Raw(0)),
            ("frame_length", Value::Physical(SCREEN_WIDTH)),
            ("framerate", Value::Physical(DEFAULT_FRAMERATE)),
        ])?;
        for channel in Channel::ALL {
            self.set_frontend(channel, FrontendConfig::default())?;
            self.set_source(channel, DataSource::Adc)?;
        }
        self.set_xmode(XMode::FullFrame)?;
        self.set_precision_mode(false)?;
        self.set_timebase(-0.25, 0.25)?;
        self.set_trigger_mode(TriggerMode::Auto)?;
        self.set_trigger(TriggerSource::Input(Channel::Ch1), Edge::Rising, 0.0)?;
        self.set_hysteresis(0.0)?;
        self.set_hf_reject(false)?;
        self.reset_outputs()
    }

    fn frame_scaling(&self) -> FrameScaling {
        let scales = Channel::ALL
            .iter()
            .map(|&ch| self.input_scale(ch, |n| self.committed(n)))
            .collect();
        let framerate = self.shadow.read_committed("framerate").unwrap_or_default();
        FrameScaling::new(OSCILLOSCOPE_ID, scales).with_framerate(framerate)
    }

    fn before_commit(&mut self) -> Result<()> {
        let Some(volts) = self.trigger_volts else {
            return Ok(());
        };
        let source = self.trigger_source();
        let (scale, range) = self.trigger_scale(source);
        let raw = (volts / scale).round();
        if raw == self.shadow.read("trigger_level")? {
            return Ok(());
        }
        if volts.abs() > range {
            return Err(MokuError::out_of_range(format!(
                "trigger level {volts} V outside ±{range} V of the staged front end"
            )));
        }
        debug!(volts, raw, "trigger level re-derived for the staged front end");
        self.shadow.stage("trigger_level", raw)
    }

    fn attach(&mut self, context: &AttachContext) {
        if context.calibration.is_empty() {
            warn!("device reported no calibration, oscilloscope frames stay in raw units");
        }
        self.calibration = context.calibration.clone();
        if context.datalog_rate_threshold > 0.0 {
            self.datalog_rate_threshold = context.datalog_rate_threshold;
        }
    }
}

impl Synthesizer for Oscilloscope {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_map_is_consistent() {
        let map = Oscilloscope::register_map();
        assert!(map.layout_conflicts().is_empty(), "{:?}", map.layout_conflicts());
    }

    #[test]
    fn timebase_derivation_for_ten_millisecond_window() {
        let (t1, t2) = (-0.005, 0.005);
        let deci = optimal_decimation(t1, t2);
        assert_eq!(deci, 306.0);
        let offset = buffer_offset(t1, deci);
        assert_eq!(offset, -2042.0);
        let rdeci = render_downsample(t1, t2, deci);
        assert_eq!(rdeci, 16.0);
        let ro = render_offset(t1, t2, deci, offset, rdeci);
        assert!((ro + 8168.0).abs() <= 1.0, "render offset {ro}");
    }

    #[test]
    fn timebase_stages_all_render_fields_together() {
        let mut osc = Oscilloscope::new();
        osc.set_timebase(-0.005, 0.005).unwrap();
        let dirty = osc.shadow().dirty_fields();
        for field in ["decimation_rate", "pretrigger", "render_deci", "render_offset"] {
            assert!(dirty.contains(&field), "{field} not staged");
        }
        assert_eq!(osc.samplerate(), ADC_SMP_RATE / 306.0);
    }

    #[test]
    fn inverted_timebase_is_rejected() {
        let mut osc = Oscilloscope::new();
        assert!(matches!(
            osc.set_timebase(0.01, -0.01),
            Err(MokuError::ValueOutOfRange(_))
        ));
        assert!(osc.shadow().dirty_fields().is_empty());
    }

    #[test]
    fn trigger_level_is_range_checked_against_frontend() {
        let mut osc = Oscilloscope::new();
        osc.set_frontend(Channel::Ch1, FrontendConfig::default())
            .unwrap();
        osc.set_trigger(TriggerSource::Input(Channel::Ch1), Edge::Rising, 4.0)
            .unwrap();

        osc.set_frontend(
            Channel::Ch1,
            FrontendConfig {
                attenuate: false,
                ..FrontendConfig::default()
            },
        )
        .unwrap();
        let err = osc
            .set_trigger(TriggerSource::Input(Channel::Ch1), Edge::Rising, 4.0)
            .unwrap_err();
        assert!(matches!(err, MokuError::ValueOutOfRange(_)));
    }

    #[test]
    fn calibrated_trigger_level_reads_back_in_volts() {
        let mut osc = Oscilloscope::new();
        osc.attach(&AttachContext {
            calibration: Calibration::from_properties(&[(
                "calibration.AG-1M-L-D-1".into(),
                "1000".into(),
            )]),
            datalog_rate_threshold: 0.0,
        });
        osc.set_frontend(Channel::Ch2, FrontendConfig::default())
            .unwrap();
        osc.set_trigger(TriggerSource::Input(Channel::Ch2), Edge::Falling, 0.5)
            .unwrap();
        assert_eq!(osc.shadow().read("trigger_level").unwrap(), 500.0);
        assert!((osc.trigger_level().unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(osc.trigger_source(), TriggerSource::Input(Channel::Ch2));
    }

    fn calibrated() -> Oscilloscope {
        let mut osc = Oscilloscope::new();
        osc.attach(&AttachContext {
            calibration: Calibration::from_properties(&[
                ("calibration.AG-1M-L-D-1".into(), "1000".into()),
                ("calibration.AG-1M-H-D-1".into(), "100".into()),
            ]),
            datalog_rate_threshold: 0.0,
        });
        osc.set_frontend(Channel::Ch1, FrontendConfig::default())
            .unwrap();
        osc
    }

    #[test]
    fn trigger_level_follows_a_later_frontend_change() {
        let mut osc = calibrated();
        osc.set_trigger(TriggerSource::Input(Channel::Ch1), Edge::Rising, 0.4)
            .unwrap();
        assert_eq!(osc.shadow().read("trigger_level").unwrap(), 400.0);

        let narrow = FrontendConfig {
            attenuate: false,
            ..FrontendConfig::default()
        };
        osc.set_frontend(Channel::Ch1, narrow).unwrap();
        assert!((osc.trigger_level().unwrap() - 0.4).abs() < 1e-12);

        osc.before_commit().unwrap();
        assert_eq!(osc.shadow().read("trigger_level").unwrap(), 40.0);
        assert!((osc.trigger_level().unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn trigger_level_outside_the_new_range_blocks_the_commit() {
        let mut osc = calibrated();
        osc.set_trigger(TriggerSource::Input(Channel::Ch1), Edge::Rising, 2.0)
            .unwrap();
        osc.set_frontend(
            Channel::Ch1,
            FrontendConfig {
                attenuate: false,
                ..FrontendConfig::default()
            },
        )
        .unwrap();
        assert!(matches!(
            osc.before_commit(),
            Err(MokuError::ValueOutOfRange(_))
        ));
        assert_eq!(osc.shadow().read("trigger_level").unwrap(), 2000.0);
    }

    #[test]
    fn uncalibrated_trigger_reads_back_the_requested_level() {
        let mut osc = Oscilloscope::new();
        osc.set_trigger(TriggerSource::Input(Channel::Ch1), Edge::Rising, 0.5)
            .unwrap();
        assert_eq!(osc.shadow().read("trigger_level").unwrap(), 1.0);
        assert_eq!(osc.trigger_level().unwrap(), 0.5);
        osc.before_commit().unwrap();
        assert_eq!(osc.shadow().read("trigger_level").unwrap(), 1.0);
    }

    #[test]
    fn precision_mode_divides_by_decimation_gain() {
        let mut osc = Oscilloscope::new();
        osc.set_samplerate(ADC_SMP_RATE / 100.0).unwrap();
        osc.set_precision_mode(true).unwrap();
        let scale = osc.input_scale(Channel::Ch1, |n| osc.staged(n));
        assert!((scale - 0.01).abs() < 1e-12);
        assert_eq!(decimation_gain(2f64.powi(21)), 2048.0);
    }

    #[test]
    fn datalogger_requires_roll_mode_and_low_rate() {
        let mut osc = Oscilloscope::new();
        osc.set_samplerate(1e3).unwrap();
        let err = osc
            .datalogger_start(Duration::from_secs(10), [true, false], true)
            .unwrap_err();
        assert!(matches!(err, MokuError::InvalidOperation(_)));

        osc.set_xmode(XMode::Roll).unwrap();
        osc.datalogger_start(Duration::from_secs(10), [true, false], true)
            .unwrap();
        assert!(matches!(
            osc.shadow().pending_datalog(),
            DatalogCommand::Start(s) if s.storage == DatalogStorage::SdCard && s.sample_rate == 1e3
        ));

        osc.set_samplerate(1e6).unwrap();
        assert!(osc
            .datalogger_start(Duration::from_secs(1), [true, true], false)
            .is_err());
    }

    #[test]
    fn defaults_stage_without_error() {
        let mut osc = Oscilloscope::new();
        osc.set_defaults().unwrap();
        assert_eq!(osc.xmode(), XMode::FullFrame);
        assert_eq!(osc.frontend(Channel::Ch2).unwrap(), FrontendConfig::default());
        assert!(!osc.output_enabled(Channel::Ch1).unwrap());
        assert_eq!(osc.shadow().read("frame_length").unwrap(), SCREEN_WIDTH);
    }
}
