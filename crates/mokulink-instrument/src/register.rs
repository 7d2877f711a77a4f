//! Register field descriptions and the per-instrument register map.
//!
//! A [`RegisterField`] names a run of bits inside the device's 128-word
//! register file together with the conversion between the physical value a
//! caller works with and the raw code stored in those bits. Several fields
//! usually share one 32-bit word, and a few wide values (48-bit DDS phase
//! increments) are split across two words.
//!
//! Fields are immutable once defined. An instrument builds its
//! [`RegisterMap`] once, in declaration order, and that order is the order
//! in which dirty fields are committed.

use std::collections::{BTreeSet, HashMap};

use crate::error::{MokuError, Result};

/// Number of 32-bit registers exposed by the device.
pub const REGISTER_COUNT: usize = 128;

pub const REG_CTL: u8 = 0;
pub const REG_PAUSE: u8 = 4;
pub const REG_OUTLEN: u8 = 5;
pub const REG_FILT: u8 = 6;
pub const REG_FRATE: u8 = 7;
pub const REG_SCALE: u8 = 8;
pub const REG_OFFSET: u8 = 9;
pub const REG_OFFSETA: u8 = 10;
pub const REG_AINCTL: u8 = 13;
pub const REG_PRETRIG: u8 = 15;
/// Written last in every commit; the device applies a register set when
/// this word changes.
pub const REG_STATE: u8 = 63;

/// Where a field's bits live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// `width` bits starting at `shift` inside one register.
    Bits { address: u8, shift: u8 },
    /// A value wider than 32 bits: the low word fills `low`, the remaining
    /// bits sit at `high_shift` inside `high`.
    Split { low: u8, high: u8, high_shift: u8 },
}

/// Values a field accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidRange {
    /// Anything that fits the field's width.
    Any,
    /// Inclusive bounds on the physical value.
    Bounds { min: f64, max: f64 },
    /// An enumerated set of raw codes.
    Choices(&'static [u64]),
}

/// One device-addressable field.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterField {
    name: &'static str,
    placement: Placement,
    width: u8,
    signed: bool,
    scale: f64,
    offset: f64,
    range: ValidRange,
}

impl RegisterField {
    /// An unsigned field of `width` bits at `shift` in register `address`.
    pub fn new(name: &'static str, address: u8, shift: u8, width: u8) -> Self {
        Self {
            name,
            placement: Placement::Bits { address, shift },
            width,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            range: ValidRange::Any,
        }
    }

    /// A single-bit flag.
    pub fn flag(name: &'static str, address: u8, bit: u8) -> Self {
        Self::new(name, address, bit, 1)
    }

    /// A field wider than one register.
    pub fn split(name: &'static str, low: u8, high: u8, high_shift: u8, width: u8) -> Self {
        Self {
            placement: Placement::Split {
                low,
                high,
                high_shift,
            },
            ..Self::new(name, low, 0, width)
        }
    }

    /// Interpret the raw bits as two's complement.
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Physical units per raw count.
    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Physical value represented by a raw code of zero.
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn bounds(mut self, min: f64, max: f64) -> Self {
        self.range = ValidRange::Bounds { min, max };
        self
    }

    pub fn choices(mut self, codes: &'static [u64]) -> Self {
        self.range = ValidRange::Choices(codes);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn range(&self) -> &ValidRange {
        &self.range
    }

    /// Registers this field touches.
    pub fn addresses(&self) -> Vec<u8> {
        match self.placement {
            Placement::Bits { address, .. } => vec![address],
            Placement::Split { low, high, .. } => vec![low, high],
        }
    }

    fn mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// Convert a physical value to the raw code, validating bounds and width.
    pub fn encode(&self, value: f64) -> Result<u64> {
        if !value.is_finite() {
            return Err(MokuError::out_of_range(format!(
                "{}: {value} is not a finite number",
                self.name
            )));
        }
        if let ValidRange::Bounds { min, max } = self.range {
            if value < min || value > max {
                return Err(MokuError::out_of_range(format!(
                    "{}: {value} outside [{min}, {max}]",
                    self.name
                )));
            }
        }
        let counts = ((value - self.offset) / self.scale).round();
        let raw = self.fit(counts)?;
        self.check_choice(raw)?;
        Ok(raw)
    }

    /// Validate a raw code supplied directly.
    pub fn check_raw(&self, raw: u64) -> Result<u64> {
        if raw & !self.mask() != 0 {
            return Err(MokuError::out_of_range(format!(
                "{}: {raw:#x} does not fit in {} bits",
                self.name, self.width
            )));
        }
        self.check_choice(raw)?;
        if let ValidRange::Bounds { min, max } = self.range {
            let value = self.decode(raw);
            if value < min || value > max {
                return Err(MokuError::out_of_range(format!(
                    "{}: {value} outside [{min}, {max}]",
                    self.name
                )));
            }
        }
        Ok(raw)
    }

    /// Convert a raw code back to its physical value.
    pub fn decode(&self, raw: u64) -> f64 {
        let raw = raw & self.mask();
        let counts = if self.signed && self.width < 64 && (raw >> (self.width - 1)) & 1 == 1 {
            raw as i64 - (1i64 << self.width)
        } else {
            raw as i64
        };
        counts as f64 * self.scale + self.offset
    }

    fn fit(&self, counts: f64) -> Result<u64> {
        let width = i32::from(self.width);
        let (lo, hi) = if self.signed {
            (-(2f64.powi(width - 1)), 2f64.powi(width - 1) - 1.0)
        } else {
            (0.0, 2f64.powi(width) - 1.0)
        };
        if counts < lo || counts > hi {
            let kind = if self.signed { "signed" } else { "unsigned" };
            return Err(MokuError::out_of_range(format!(
                "{}: {counts} doesn't fit in {} {kind} bits",
                self.name, self.width
            )));
        }
        Ok((counts as i64 as u64) & self.mask())
    }

    fn check_choice(&self, raw: u64) -> Result<()> {
        match self.range {
            ValidRange::Choices(codes) if !codes.contains(&raw) => Err(MokuError::out_of_range(
                format!("{}: code {raw} not one of {codes:?}", self.name),
            )),
            _ => Ok(()),
        }
    }

    /// Read this field's raw code out of a register file.
    pub fn extract(&self, words: &[u32]) -> u64 {
        match self.placement {
            Placement::Bits { address, shift } => {
                (u64::from(words[usize::from(address)]) >> shift) & self.mask()
            }
            Placement::Split {
                low,
                high,
                high_shift,
            } => {
                let high_bits = (u64::from(words[usize::from(high)]) >> high_shift)
                    & ((1u64 << (self.width - 32)) - 1);
                (high_bits << 32) | u64::from(words[usize::from(low)])
            }
        }
    }

    /// Write this field's raw code into a register file, leaving the other
    /// bits of each word untouched.
    pub fn insert(&self, words: &mut [u32], raw: u64) {
        let raw = raw & self.mask();
        match self.placement {
            Placement::Bits { address, shift } => {
                let mask = (self.mask() as u32) << shift;
                let word = &mut words[usize::from(address)];
                *word = (*word & !mask) | (((raw as u32) << shift) & mask);
            }
            Placement::Split {
                low,
                high,
                high_shift,
            } => {
                words[usize::from(low)] = raw as u32;
                let mask = (((1u64 << (self.width - 32)) - 1) as u32) << high_shift;
                let word = &mut words[usize::from(high)];
                *word = (*word & !mask) | ((((raw >> 32) as u32) << high_shift) & mask);
            }
        }
    }

    /// Bits owned in each touched register, as (address, mask).
    fn owned_bits(&self) -> Vec<(u8, u32)> {
        match self.placement {
            Placement::Bits { address, shift } => {
                vec![(address, (self.mask() as u32).wrapping_shl(u32::from(shift)))]
            }
            Placement::Split {
                low,
                high,
                high_shift,
            } => vec![
                (low, u32::MAX),
                (
                    high,
                    (((1u64 << (self.width - 32)) - 1) as u32).wrapping_shl(u32::from(high_shift)),
                ),
            ],
        }
    }

    fn layout_error(&self) -> Option<String> {
        let fits = match self.placement {
            Placement::Bits { address, shift } => {
                usize::from(address) < REGISTER_COUNT
                    && self.width >= 1
                    && u32::from(shift) + u32::from(self.width) <= 32
            }
            Placement::Split {
                low,
                high,
                high_shift,
            } => {
                usize::from(low.max(high)) < REGISTER_COUNT
                    && self.width > 32
                    && self.width <= 64
                    && u32::from(high_shift) + u32::from(self.width - 32) <= 32
            }
        };
        (!fits).then(|| format!("{} does not fit its registers", self.name))
    }
}

/// The ordered set of fields an instrument exposes.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    fields: Vec<RegisterField>,
    index: HashMap<&'static str, usize>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append fields in declaration order. A name that is already present
    /// keeps its first definition.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = RegisterField>) -> Self {
        for field in fields {
            if self.index.contains_key(field.name) {
                continue;
            }
            self.index.insert(field.name, self.fields.len());
            self.fields.push(field);
        }
        self
    }

    pub fn field(&self, name: &str) -> Result<&RegisterField> {
        self.index_of(name).map(|idx| &self.fields[idx])
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| MokuError::invalid(format!("unknown register field '{name}'")))
    }

    pub fn fields(&self) -> &[RegisterField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every register touched by at least one field, ascending.
    pub fn addresses(&self) -> Vec<u8> {
        self.fields
            .iter()
            .flat_map(RegisterField::addresses)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Fields that do not fit their registers or claim bits another field
    /// already owns. Empty for a well-formed map.
    pub fn layout_conflicts(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut owners: HashMap<u8, Vec<(u32, &'static str)>> = HashMap::new();
        for field in &self.fields {
            if let Some(problem) = field.layout_error() {
                problems.push(problem);
                continue;
            }
            for (address, mask) in field.owned_bits() {
                let taken = owners.entry(address).or_default();
                for (other_mask, other) in taken.iter() {
                    if other_mask & mask != 0 {
                        problems.push(format!(
                            "{} overlaps {other} in register {address}",
                            field.name
                        ));
                    }
                }
                taken.push((mask, field.name));
            }
        }
        problems
    }
}

/// Fields every instrument shares: control, rendering, input relays and the
/// state id.
pub fn common_fields() -> Vec<RegisterField> {
    vec![
        RegisterField::flag("instrument_reset", REG_CTL, 0),
        RegisterField::flag("pause", REG_PAUSE, 0),
        RegisterField::new("frame_length", REG_OUTLEN, 0, 12),
        RegisterField::flag("keep_last", REG_OUTLEN, 28),
        RegisterField::new("x_mode", REG_OUTLEN, 29, 2).choices(&[0, 1, 2]),
        RegisterField::new("render_mode", REG_FILT, 0, 2),
        RegisterField::new("framerate", REG_FRATE, 0, 8)
            .scaled(477.0 / 256.0)
            .bounds(1.0, 30.0),
        RegisterField::new("render_deci", REG_SCALE, 0, 16)
            .scaled(1.0 / 128.0)
            .with_offset(1.0),
        RegisterField::new("render_deci_alt", REG_SCALE, 16, 16)
            .scaled(1.0 / 128.0)
            .with_offset(1.0),
        RegisterField::new("render_offset", REG_OFFSET, 0, 32).signed(),
        RegisterField::new("render_offset_alt", REG_OFFSETA, 0, 32).signed(),
        RegisterField::new("relays_ch1", REG_AINCTL, 0, 3),
        RegisterField::new("relays_ch2", REG_AINCTL, 3, 3),
        RegisterField::new("pretrigger", REG_PRETRIG, 0, 32).signed(),
        RegisterField::new("state_id", REG_STATE, 0, 8),
        RegisterField::new("state_id_alt", REG_STATE, 16, 8),
    ]
}
