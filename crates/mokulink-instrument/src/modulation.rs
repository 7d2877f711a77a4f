//! Modulation routing between the synthesizer outputs.
//!
//! Each output may be modulated by its internal oscillator, its paired ADC
//! input or another output. Output-to-output references form a directed
//! graph; any cycle in it, including an output modulating itself, is
//! rejected before anything is staged.

use std::fmt;

use crate::error::{MokuError, Result};
use crate::instrument::Channel;

/// What the modulating signal changes on the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulationType {
    /// Depth is a fraction of full amplitude, 0 to 1.
    Amplitude,
    /// Depth is the peak frequency deviation in Hz.
    Frequency,
    /// Depth is the peak phase deviation in degrees.
    Phase,
}

impl ModulationType {
    pub(crate) fn code(self) -> u64 {
        match self {
            ModulationType::Amplitude => 1,
            ModulationType::Frequency => 2,
            ModulationType::Phase => 4,
        }
    }

    pub(crate) fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(ModulationType::Amplitude),
            2 => Some(ModulationType::Frequency),
            4 => Some(ModulationType::Phase),
            _ => None,
        }
    }
}

/// Where the modulating signal comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulationSource {
    Internal,
    /// The ADC input paired with the carrier output.
    Adc,
    Output(Channel),
}

impl fmt::Display for ModulationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModulationSource::Internal => f.write_str("internal oscillator"),
            ModulationSource::Adc => f.write_str("adc input"),
            ModulationSource::Output(ch) => write!(f, "output {ch}"),
        }
    }
}

/// One output's modulation configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulationChain {
    pub carrier: Channel,
    pub source: ModulationSource,
    pub kind: ModulationType,
    pub depth: f64,
}

impl ModulationChain {
    fn modulating_output(&self) -> Option<Channel> {
        match self.source {
            ModulationSource::Output(ch) => Some(ch),
            _ => None,
        }
    }
}

/// Fail if following output-to-output references from any carrier returns
/// to a channel already on the path.
pub fn check_acyclic(chains: &[ModulationChain]) -> Result<()> {
    for start in chains {
        let mut path = vec![start.carrier];
        let mut next = start.modulating_output();
        while let Some(channel) = next {
            if path.contains(&channel) {
                path.push(channel);
                let route = path
                    .iter()
                    .map(Channel::to_string)
                    .collect::<Vec<_>>()
                    .join(" <- ");
                return Err(MokuError::invalid(format!("modulation cycle: {route}")));
            }
            path.push(channel);
            next = chains
                .iter()
                .find(|c| c.carrier == channel)
                .and_then(ModulationChain::modulating_output);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(carrier: Channel, source: ModulationSource) -> ModulationChain {
        ModulationChain {
            carrier,
            source,
            kind: ModulationType::Frequency,
            depth: 1e3,
        }
    }

    #[test]
    fn one_way_reference_is_fine() {
        let chains = [
            chain(Channel::Ch1, ModulationSource::Output(Channel::Ch2)),
            chain(Channel::Ch2, ModulationSource::Internal),
        ];
        check_acyclic(&chains).unwrap();
    }

    #[test]
    fn mutual_reference_is_a_cycle() {
        let chains = [
            chain(Channel::Ch1, ModulationSource::Output(Channel::Ch2)),
            chain(Channel::Ch2, ModulationSource::Output(Channel::Ch1)),
        ];
        let err = check_acyclic(&chains).unwrap_err();
        assert!(matches!(err, MokuError::InvalidOperation(ref m) if m.contains("ch1 <- ch2 <- ch1")));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let chains = [chain(Channel::Ch2, ModulationSource::Output(Channel::Ch2))];
        assert!(check_acyclic(&chains).is_err());
    }

    #[test]
    fn codes_round_trip() {
        for kind in [
            ModulationType::Amplitude,
            ModulationType::Frequency,
            ModulationType::Phase,
        ] {
            assert_eq!(ModulationType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ModulationType::from_code(0), None);
    }
}
