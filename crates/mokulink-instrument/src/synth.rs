//! Two-channel DDS synthesizer.
//!
//! Each output is a phase accumulator clocked at the DAC rate. The
//! frequency register holds the 48-bit phase increment per sample; sine
//! output looks the accumulator up in a table, square output compares it
//! against three thresholds:
//!
//! ```text
//!   phase   0 ......... T0 ......... T1 ......... T2 ......... 2π
//!   level   low, rising | high        | falling    | low
//! ```
//!
//! The rise and fall slopes are programmed as rates so the edges span
//! exactly `T0` and `T2 - T1` of the cycle. Equal and opposite slopes give a
//! triangle, a zero-width fall gives a sawtooth: ramps are square waves with
//! asymmetric edges, not a waveform of their own.

use tracing::warn;

use crate::error::{MokuError, Result};
use crate::instrument::{Channel, Instrument};
use crate::modulation::{check_acyclic, ModulationChain, ModulationSource, ModulationType};
use crate::register::RegisterField;
use crate::shadow::Value;

pub const REG_SG_WAVEFORMS: u8 = 96;
pub const REG_SG_MODSOURCE: u8 = 123;

pub const DAC_SMP_RATE: f64 = 1e9;
/// Hz per count of a 48-bit phase increment.
pub const FREQ_SCALE: f64 = DAC_SMP_RATE / 281_474_976_710_656.0;
/// Radians per count of a 32-bit phase.
pub const PHASE_SCALE: f64 = std::f64::consts::TAU / 4_294_967_296.0;
/// Volts per count of the amplitude and offset registers.
pub const AMP_SCALE: f64 = 4.0 / 65_536.0;
/// Volts per count of a DAC sample looped back into the acquisition path.
pub const DAC_VOLTS_PER_BIT: f64 = 1.0 / 32_768.0;

/// Peak-to-peak amplitude limit, in volts.
pub const MAX_AMPLITUDE: f64 = 2.0;
/// No output may swing beyond this many volts from ground.
pub const MAX_OUTPUT_VOLTAGE: f64 = 1.0;
pub const MAX_SINE_FREQUENCY: f64 = 250e6;
pub const MAX_SQUARE_FREQUENCY: f64 = 100e6;
pub const MAX_MOD_FREQUENCY: f64 = 62.5e6;
/// Square-wave edges snap to the 1 ns DAC clock; above this the period
/// jitter becomes a visible fraction of the cycle.
pub const SQUARE_JITTER_WARNING: f64 = 10e6;

/// Hz per count of a frequency-modulation depth.
const FM_DEPTH_SCALE: f64 = DAC_SMP_RATE / 4_294_967_296.0;
const AM_DEPTH_FULL: f64 = 65_536.0;
const TURN: f64 = 4_294_967_296.0;
const MAX_RATE: u64 = (1 << 48) - 1;

const WAVE_SINE: u64 = 0;
const WAVE_SQUARE: u64 = 1;
const WAVEFORMS: [u64; 2] = [WAVE_SINE, WAVE_SQUARE];

const MODSRC_INTERNAL: u64 = 0;
const MODSRC_ADC: u64 = 1;
const MODSRC_OUTPUT: u64 = 2;

struct Output {
    enable: &'static str,
    waveform: &'static str,
    modulation: &'static str,
    mod_source: &'static str,
    frequency: &'static str,
    phase: &'static str,
    amplitude: &'static str,
    offset: &'static str,
    t0: &'static str,
    t1: &'static str,
    t2: &'static str,
    riserate: &'static str,
    fallrate: &'static str,
    mod_frequency: &'static str,
    mod_depth: &'static str,
}

const OUT1: Output = Output {
    enable: "out1_enable",
    waveform: "out1_waveform",
    modulation: "out1_modulation",
    mod_source: "out1_modsource",
    frequency: "out1_frequency",
    phase: "out1_phase",
    amplitude: "out1_amplitude",
    offset: "out1_offset",
    t0: "out1_t0",
    t1: "out1_t1",
    t2: "out1_t2",
    riserate: "out1_riserate",
    fallrate: "out1_fallrate",
    mod_frequency: "mod1_frequency",
    mod_depth: "mod1_depth",
};

const OUT2: Output = Output {
    enable: "out2_enable",
    waveform: "out2_waveform",
    modulation: "out2_modulation",
    mod_source: "out2_modsource",
    frequency: "out2_frequency",
    phase: "out2_phase",
    amplitude: "out2_amplitude",
    offset: "out2_offset",
    t0: "out2_t0",
    t1: "out2_t1",
    t2: "out2_t2",
    riserate: "out2_riserate",
    fallrate: "out2_fallrate",
    mod_frequency: "mod2_frequency",
    mod_depth: "mod2_depth",
};

fn output(channel: Channel) -> &'static Output {
    match channel {
        Channel::Ch1 => &OUT1,
        Channel::Ch2 => &OUT2,
    }
}

/// Parameter registers of one output, in ascending order of use.
struct OutputRegs {
    freq_l: u8,
    phase: u8,
    amp: u8,
    modf_l: u8,
    modf_h: u8,
    t0: u8,
    t1: u8,
    t2: u8,
    freq_h: u8,
    rise_l: u8,
    fall_l: u8,
    rate_h: u8,
    mod_depth: u8,
}

const OUT1_REGS: OutputRegs = OutputRegs {
    freq_l: 97,
    phase: 98,
    amp: 99,
    modf_l: 100,
    modf_h: 101,
    t0: 102,
    t1: 103,
    t2: 104,
    freq_h: 105,
    rise_l: 106,
    fall_l: 107,
    rate_h: 108,
    mod_depth: 121,
};

const OUT2_REGS: OutputRegs = OutputRegs {
    freq_l: 109,
    phase: 110,
    amp: 111,
    modf_l: 112,
    modf_h: 113,
    t0: 114,
    t1: 115,
    t2: 116,
    freq_h: 117,
    rise_l: 118,
    fall_l: 119,
    rate_h: 120,
    mod_depth: 122,
};

/// Register fields of both synthesizer outputs. Per-output parameters are
/// declared before the shared waveform and enable word so a commit sets an
/// output up before switching it on.
pub fn synth_fields() -> Vec<RegisterField> {
    let mut fields = Vec::new();
    for (names, regs) in [(&OUT1, &OUT1_REGS), (&OUT2, &OUT2_REGS)] {
        fields.extend([
            RegisterField::split(names.frequency, regs.freq_l, regs.freq_h, 0, 48)
                .scaled(FREQ_SCALE)
                .bounds(0.0, MAX_SINE_FREQUENCY),
            RegisterField::new(names.phase, regs.phase, 0, 32).scaled(PHASE_SCALE),
            RegisterField::new(names.amplitude, regs.amp, 0, 16)
                .scaled(AMP_SCALE)
                .bounds(0.0, MAX_AMPLITUDE),
            RegisterField::new(names.offset, regs.amp, 16, 16)
                .signed()
                .scaled(AMP_SCALE)
                .bounds(-MAX_OUTPUT_VOLTAGE, MAX_OUTPUT_VOLTAGE),
            RegisterField::split(names.mod_frequency, regs.modf_l, regs.modf_h, 0, 48)
                .scaled(FREQ_SCALE)
                .bounds(0.0, MAX_MOD_FREQUENCY),
            RegisterField::new(names.t0, regs.t0, 0, 32).scaled(1.0 / TURN),
            RegisterField::new(names.t1, regs.t1, 0, 32).scaled(1.0 / TURN),
            RegisterField::new(names.t2, regs.t2, 0, 32).scaled(1.0 / TURN),
            RegisterField::split(names.riserate, regs.rise_l, regs.rate_h, 0, 48),
            RegisterField::split(names.fallrate, regs.fall_l, regs.rate_h, 16, 48),
            RegisterField::new(names.mod_depth, regs.mod_depth, 0, 32),
        ]);
    }
    fields.extend([
        RegisterField::flag(OUT1.enable, REG_SG_WAVEFORMS, 0),
        RegisterField::flag(OUT2.enable, REG_SG_WAVEFORMS, 1),
        RegisterField::new(OUT1.waveform, REG_SG_WAVEFORMS, 4, 3).choices(&WAVEFORMS),
        RegisterField::new(OUT2.waveform, REG_SG_WAVEFORMS, 7, 3).choices(&WAVEFORMS),
        RegisterField::new(OUT1.modulation, REG_SG_WAVEFORMS, 16, 8).choices(&[0, 1, 2, 4]),
        RegisterField::new(OUT2.modulation, REG_SG_WAVEFORMS, 24, 8).choices(&[0, 1, 2, 4]),
        RegisterField::new(OUT1.mod_source, REG_SG_MODSOURCE, 1, 2).choices(&[0, 1, 2]),
        RegisterField::new(OUT2.mod_source, REG_SG_MODSOURCE, 3, 2).choices(&[0, 1, 2]),
    ]);
    fields
}

/// Shape of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
}

/// Sine output parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineWave {
    /// Peak-to-peak volts.
    pub amplitude: f64,
    pub frequency: f64,
    pub offset: f64,
    /// Degrees.
    pub phase: f64,
}

impl SineWave {
    pub fn new(amplitude: f64, frequency: f64) -> Self {
        Self {
            amplitude,
            frequency,
            offset: 0.0,
            phase: 0.0,
        }
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_phase(mut self, degrees: f64) -> Self {
        self.phase = degrees;
        self
    }
}

/// Square output parameters. `duty`, `rise` and `fall` are fractions of
/// one cycle; zero-width edges switch as fast as the DAC allows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SquareWave {
    pub amplitude: f64,
    pub frequency: f64,
    pub offset: f64,
    pub phase: f64,
    pub duty: f64,
    pub rise: f64,
    pub fall: f64,
}

impl SquareWave {
    pub fn new(amplitude: f64, frequency: f64) -> Self {
        Self {
            amplitude,
            frequency,
            offset: 0.0,
            phase: 0.0,
            duty: 0.5,
            rise: 0.0,
            fall: 0.0,
        }
    }

    pub fn with_duty(mut self, duty: f64) -> Self {
        self.duty = duty;
        self
    }

    pub fn with_edges(mut self, rise: f64, fall: f64) -> Self {
        self.rise = rise;
        self.fall = fall;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_phase(mut self, degrees: f64) -> Self {
        self.phase = degrees;
        self
    }
}

fn check_level(amplitude: f64, offset: f64) -> Result<()> {
    if !(0.0..=MAX_AMPLITUDE).contains(&amplitude) {
        return Err(MokuError::out_of_range(format!(
            "amplitude {amplitude} Vpp outside [0, {MAX_AMPLITUDE}]"
        )));
    }
    if !offset.is_finite() || offset.abs() + amplitude / 2.0 > MAX_OUTPUT_VOLTAGE {
        return Err(MokuError::out_of_range(format!(
            "amplitude {amplitude} Vpp with offset {offset} V exceeds ±{MAX_OUTPUT_VOLTAGE} V"
        )));
    }
    Ok(())
}

fn check_frequency(frequency: f64, max: f64) -> Result<()> {
    if !(0.0..=max).contains(&frequency) {
        return Err(MokuError::out_of_range(format!(
            "frequency {frequency} Hz outside [0, {max}]"
        )));
    }
    Ok(())
}

/// Fraction of a cycle as a 32-bit phase threshold.
fn turn_fraction(fraction: f64) -> u64 {
    (fraction * TURN).round().clamp(0.0, TURN - 1.0) as u64
}

fn phase_raw(degrees: f64) -> Result<u64> {
    if !degrees.is_finite() {
        return Err(MokuError::out_of_range(format!("phase {degrees}")));
    }
    Ok(turn_fraction(degrees.rem_euclid(360.0) / 360.0))
}

/// Slope of an edge spanning `width` of a cycle at `frequency`, as a 48-bit
/// rate. Zero-width edges get the fastest rate.
fn edge_rate(frequency: f64, width: f64) -> u64 {
    if width <= 0.0 {
        return MAX_RATE;
    }
    ((frequency / width) / FREQ_SCALE)
        .round()
        .clamp(0.0, MAX_RATE as f64) as u64
}

fn depth_raw(kind: ModulationType, depth: f64) -> Result<u64> {
    let (max, counts) = match kind {
        ModulationType::Amplitude => (1.0, depth * AM_DEPTH_FULL),
        ModulationType::Frequency => (MAX_SINE_FREQUENCY, depth / FM_DEPTH_SCALE),
        ModulationType::Phase => (360.0, depth / 360.0 * TURN),
    };
    if !(0.0..=max).contains(&depth) {
        return Err(MokuError::out_of_range(format!(
            "{kind:?} modulation depth {depth} outside [0, {max}]"
        )));
    }
    Ok(counts.round().clamp(0.0, TURN - 1.0) as u64)
}

fn depth_value(kind: ModulationType, raw: u64) -> f64 {
    let raw = raw as f64;
    match kind {
        ModulationType::Amplitude => raw / AM_DEPTH_FULL,
        ModulationType::Frequency => raw * FM_DEPTH_SCALE,
        ModulationType::Phase => raw / TURN * 360.0,
    }
}

/// Waveform synthesis, available on every instrument that embeds the
/// synthesizer block.
pub trait Synthesizer: Instrument {
    fn synth_sinewave(&mut self, channel: Channel, wave: SineWave) -> Result<()> {
        check_level(wave.amplitude, wave.offset)?;
        check_frequency(wave.frequency, MAX_SINE_FREQUENCY)?;
        let out = output(channel);
        self.shadow_mut().stage_group(&[
            (out.waveform, Value::Raw(WAVE_SINE)),
            (out.frequency, Value::Physical(wave.frequency)),
            (out.amplitude, Value::Physical(wave.amplitude)),
            (out.offset, Value::Physical(wave.offset)),
            (out.phase, Value::Raw(phase_raw(wave.phase)?)),
            (out.enable, Value::Raw(1)),
        ])
    }

    fn synth_squarewave(&mut self, channel: Channel, wave: SquareWave) -> Result<()> {
        check_level(wave.amplitude, wave.offset)?;
        check_frequency(wave.frequency, MAX_SQUARE_FREQUENCY)?;
        for (name, value) in [("duty", wave.duty), ("rise", wave.rise), ("fall", wave.fall)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MokuError::out_of_range(format!(
                    "{name} {value} outside [0, 1]"
                )));
            }
        }
        if wave.duty < wave.rise {
            return Err(MokuError::out_of_range(format!(
                "duty {} too small for rise time {}",
                wave.duty, wave.rise
            )));
        }
        if wave.duty + wave.fall > 1.0 {
            return Err(MokuError::out_of_range(format!(
                "duty {} and fall time {} exceed one cycle",
                wave.duty, wave.fall
            )));
        }
        if wave.frequency > SQUARE_JITTER_WARNING {
            warn!(
                channel = %channel,
                frequency = wave.frequency,
                "square wave above {SQUARE_JITTER_WARNING} Hz will show edge jitter"
            );
        }

        let out = output(channel);
        self.shadow_mut().stage_group(&[
            (out.waveform, Value::Raw(WAVE_SQUARE)),
            (out.frequency, Value::Physical(wave.frequency)),
            (out.amplitude, Value::Physical(wave.amplitude)),
            (out.offset, Value::Physical(wave.offset)),
            (out.phase, Value::Raw(phase_raw(wave.phase)?)),
            (out.t0, Value::Raw(turn_fraction(wave.rise))),
            (out.t1, Value::Raw(turn_fraction(wave.duty))),
            (out.t2, Value::Raw(turn_fraction(wave.duty + wave.fall))),
            (out.riserate, Value::Raw(edge_rate(wave.frequency, wave.rise))),
            (out.fallrate, Value::Raw(edge_rate(wave.frequency, wave.fall))),
            (out.enable, Value::Raw(1)),
        ])
    }

    /// Ramp with the rising edge taking `symmetry` of the cycle: 0.5 is a
    /// triangle, 1.0 a rising sawtooth.
    fn synth_rampwave(
        &mut self,
        channel: Channel,
        amplitude: f64,
        frequency: f64,
        symmetry: f64,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&symmetry) {
            return Err(MokuError::out_of_range(format!(
                "symmetry {symmetry} outside [0, 1]"
            )));
        }
        let wave = SquareWave::new(amplitude, frequency)
            .with_duty(symmetry)
            .with_edges(symmetry, 1.0 - symmetry);
        self.synth_squarewave(channel, wave)
    }

    /// Route a modulating signal onto `channel`. `frequency` sets the
    /// internal oscillator and is ignored by the other sources.
    fn synth_modulate(
        &mut self,
        channel: Channel,
        kind: ModulationType,
        source: ModulationSource,
        depth: f64,
        frequency: f64,
    ) -> Result<()> {
        let source_code = match source {
            ModulationSource::Internal => MODSRC_INTERNAL,
            ModulationSource::Adc => MODSRC_ADC,
            ModulationSource::Output(_) => MODSRC_OUTPUT,
        };

        let mut chains: Vec<ModulationChain> = Channel::ALL
            .into_iter()
            .filter(|&ch| ch != channel)
            .filter_map(|ch| self.modulation(ch).transpose())
            .collect::<Result<_>>()?;
        chains.push(ModulationChain {
            carrier: channel,
            source,
            kind,
            depth,
        });
        check_acyclic(&chains)?;

        let out = output(channel);
        self.shadow_mut().stage_group(&[
            (out.modulation, Value::Raw(kind.code())),
            (out.mod_source, Value::Raw(source_code)),
            (out.mod_depth, Value::Raw(depth_raw(kind, depth)?)),
            (out.mod_frequency, Value::Physical(frequency)),
        ])
    }

    fn synth_modulate_off(&mut self, channel: Channel) -> Result<()> {
        self.shadow_mut()
            .stage_raw(output(channel).modulation, 0)
    }

    fn enable_output(&mut self, channel: Channel, enable: bool) -> Result<()> {
        self.shadow_mut()
            .stage_raw(output(channel).enable, u64::from(enable))
    }

    fn output_enabled(&self, channel: Channel) -> Result<bool> {
        Ok(self.shadow().read_raw(output(channel).enable)? != 0)
    }

    fn waveform(&self, channel: Channel) -> Result<Waveform> {
        match self.shadow().read_raw(output(channel).waveform)? {
            WAVE_SQUARE => Ok(Waveform::Square),
            _ => Ok(Waveform::Sine),
        }
    }

    /// Output frequency in Hz.
    fn frequency(&self, channel: Channel) -> Result<f64> {
        self.shadow().read(output(channel).frequency)
    }

    /// Peak-to-peak amplitude in volts.
    fn amplitude(&self, channel: Channel) -> Result<f64> {
        self.shadow().read(output(channel).amplitude)
    }

    /// Current modulation of `channel`, if any.
    fn modulation(&self, channel: Channel) -> Result<Option<ModulationChain>> {
        let out = output(channel);
        let shadow = self.shadow();
        let Some(kind) = ModulationType::from_code(shadow.read_raw(out.modulation)?) else {
            return Ok(None);
        };
        let source = match shadow.read_raw(out.mod_source)? {
            MODSRC_ADC => ModulationSource::Adc,
            MODSRC_OUTPUT => ModulationSource::Output(channel.other()),
            _ => ModulationSource::Internal,
        };
        Ok(Some(ModulationChain {
            carrier: channel,
            source,
            kind,
            depth: depth_value(kind, shadow.read_raw(out.mod_depth)?),
        }))
    }

    /// Switch both outputs off and clear any modulation.
    fn reset_outputs(&mut self) -> Result<()> {
        self.shadow_mut().stage_group(&[
            (OUT1.enable, Value::Raw(0)),
            (OUT2.enable, Value::Raw(0)),
            (OUT1.modulation, Value::Raw(0)),
            (OUT2.modulation, Value::Raw(0)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterMap;

    #[test]
    fn synth_block_has_no_overlaps() {
        let map = RegisterMap::new().with_fields(synth_fields());
        assert!(map.layout_conflicts().is_empty(), "{:?}", map.layout_conflicts());
    }

    #[test]
    fn edge_rate_spans_requested_width() {
        assert_eq!(edge_rate(1e3, 0.0), MAX_RATE);
        let rate = edge_rate(1e6, 0.25);
        let expected = 4e6 / FREQ_SCALE;
        assert!((rate as f64 - expected).abs() <= 1.0);
    }

    #[test]
    fn thresholds_clamp_to_register_width() {
        assert_eq!(turn_fraction(1.0), u32::MAX as u64);
        assert_eq!(turn_fraction(0.5), 1 << 31);
        assert_eq!(phase_raw(450.0).unwrap(), 1 << 30);
        assert_eq!(phase_raw(-90.0).unwrap(), 3 << 30);
    }

    #[test]
    fn level_limits() {
        check_level(2.0, 0.0).unwrap();
        check_level(1.0, 0.5).unwrap();
        assert!(check_level(1.0, 0.6).is_err());
        assert!(check_level(2.1, 0.0).is_err());
        assert!(check_level(-0.1, 0.0).is_err());
    }

    #[test]
    fn modulation_depths() {
        assert_eq!(depth_raw(ModulationType::Amplitude, 0.5).unwrap(), 32_768);
        assert!(depth_raw(ModulationType::Amplitude, 1.5).is_err());
        assert_eq!(depth_raw(ModulationType::Phase, 90.0).unwrap(), 1 << 30);
        let fm = depth_raw(ModulationType::Frequency, 1e6).unwrap();
        assert!((depth_value(ModulationType::Frequency, fm) - 1e6).abs() < 1.0);
    }
}
