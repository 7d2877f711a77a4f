//! Standalone signal generator: the synthesizer outputs without an
//! acquisition path.

use crate::codec::FrameScaling;
use crate::error::Result;
use crate::instrument::Instrument;
use crate::register::{common_fields, RegisterMap};
use crate::shadow::{ShadowState, Value};
use crate::synth::{synth_fields, Synthesizer};

pub const SIGNAL_GENERATOR_ID: u8 = 4;

#[derive(Debug, Clone)]
pub struct SignalGenerator {
    shadow: ShadowState,
}

impl Default for SignalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalGenerator {
    pub fn new() -> Self {
        Self {
            shadow: ShadowState::new(Self::register_map().into()),
        }
    }

    pub fn register_map() -> RegisterMap {
        RegisterMap::new()
            .with_fields(common_fields())
            .with_fields(synth_fields())
    }
}

impl Instrument for SignalGenerator {
    fn id(&self) -> u8 {
        SIGNAL_GENERATOR_ID
    }

    fn name(&self) -> &'static str {
        "signal_generator"
    }

    fn shadow(&self) -> &ShadowState {
        &self.shadow
    }

    fn shadow_mut(&mut self) -> &mut ShadowState {
        &mut self.shadow
    }

    fn set_defaults(&mut self) -> Result<()> {
        self.shadow
            .stage_group(&[("instrument_reset", Value::Raw(0))])?;
        self.reset_outputs()
    }

    fn frame_scaling(&self) -> FrameScaling {
        FrameScaling::new(SIGNAL_GENERATOR_ID, Vec::new())
    }

    fn streams_frames(&self) -> bool {
        false
    }
}

impl Synthesizer for SignalGenerator {}
