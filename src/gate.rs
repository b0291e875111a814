//! Heuristic chunk gates. A gate looks at one decoded chunk and decides
//! whether it plausibly came from the board's audio path; anything else
//! (framing garbage, disconnected-input noise, line silence) is dropped
//! before accumulation.

use std::fmt;

use clap::ValueEnum;

use crate::pcm;

/// Verdict for a single chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Reject,
    /// Not enough signal to judge; the chunk is kept so audio is never lost
    /// to an indecisive gate.
    Uncertain,
}

/// Per-chunk plausibility check.
///
/// # Input Contract
/// Chunks arrive as signed 16-bit samples produced by the configured
/// decoder, so a gate never has to know about sample widths or byte order.
/// 8-bit captures are widened before they get here.
pub trait ChunkGate {
    fn assess(&mut self, samples: &[i16]) -> GateDecision;
    fn reset(&mut self);
    fn name(&self) -> &'static str {
        "unknown_gate"
    }
}

/// Gate selected on the command line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum GateKind {
    /// Accept every chunk.
    None,
    /// Require the chunk RMS to clear a decibel threshold.
    Energy,
    /// Require most samples to sit inside the plausible ADC code range.
    Range,
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateKind::None => write!(f, "none"),
            GateKind::Energy => write!(f, "energy"),
            GateKind::Range => write!(f, "range"),
        }
    }
}

/// RMS-energy gate. Drops chunks quieter than the threshold, which filters
/// line silence when the board streams zeros between bursts.
#[derive(Debug, Clone)]
pub struct EnergyGate {
    threshold_db: f32,
}

impl EnergyGate {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }
}

impl ChunkGate for EnergyGate {
    fn assess(&mut self, samples: &[i16]) -> GateDecision {
        if samples.is_empty() {
            return GateDecision::Uncertain;
        }
        if pcm::rms_db(samples) >= self.threshold_db {
            GateDecision::Accept
        } else {
            GateDecision::Reject
        }
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "energy_gate"
    }
}

/// Plausible-range gate. A 12-bit ADC centered mid-scale produces samples
/// within +/-2048 after offset removal; misaligned bytes or non-audio
/// traffic decode to magnitudes far outside that band.
#[derive(Debug, Clone)]
pub struct RangeGate {
    half_range: i32,
    min_in_range: f32,
}

impl RangeGate {
    /// `adc_bits` is the converter resolution; the acceptance band is half
    /// the code range on either side of zero.
    pub fn new(adc_bits: u8, min_in_range: f32) -> Self {
        Self {
            half_range: 1i32 << (adc_bits.clamp(2, 16) - 1),
            min_in_range,
        }
    }
}

impl ChunkGate for RangeGate {
    fn assess(&mut self, samples: &[i16]) -> GateDecision {
        if samples.is_empty() {
            return GateDecision::Uncertain;
        }
        let in_range = samples
            .iter()
            .filter(|&&s| i32::from(s).abs() <= self.half_range)
            .count();
        let fraction = in_range as f32 / samples.len() as f32;
        if fraction >= self.min_in_range {
            GateDecision::Accept
        } else {
            GateDecision::Reject
        }
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "range_gate"
    }
}

/// Build the gate requested by the CLI, or `None` when gating is off.
pub fn build_gate(
    kind: GateKind,
    threshold_db: f32,
    adc_bits: u8,
    min_in_range: f32,
) -> Option<Box<dyn ChunkGate>> {
    match kind {
        GateKind::None => None,
        GateKind::Energy => Some(Box::new(EnergyGate::new(threshold_db))),
        GateKind::Range => Some(Box::new(RangeGate::new(adc_bits, min_in_range))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_gate_accepts_loud_chunks() {
        let mut gate = EnergyGate::new(-40.0);
        let loud = vec![i16::MAX / 4; 256];
        assert_eq!(gate.assess(&loud), GateDecision::Accept);
    }

    #[test]
    fn energy_gate_rejects_silence() {
        let mut gate = EnergyGate::new(-40.0);
        let quiet = vec![3i16; 256];
        assert_eq!(gate.assess(&quiet), GateDecision::Reject);
    }

    #[test]
    fn energy_gate_is_uncertain_on_empty_input() {
        let mut gate = EnergyGate::new(-40.0);
        assert_eq!(gate.assess(&[]), GateDecision::Uncertain);
    }

    #[test]
    fn range_gate_accepts_centered_adc_codes() {
        let mut gate = RangeGate::new(12, 0.9);
        let samples: Vec<i16> = (0..256).map(|i| (((i % 64) - 32) * 30) as i16).collect();
        assert_eq!(gate.assess(&samples), GateDecision::Accept);
    }

    #[test]
    fn range_gate_rejects_misaligned_decodes() {
        let mut gate = RangeGate::new(12, 0.9);
        // Byte-shifted words decode with the high bit set, far out of band.
        let samples = vec![0x7F00i16; 256];
        assert_eq!(gate.assess(&samples), GateDecision::Reject);
    }

    #[test]
    fn range_gate_tolerates_a_few_outliers() {
        let mut gate = RangeGate::new(12, 0.9);
        let mut samples = vec![100i16; 100];
        for slot in samples.iter_mut().take(5) {
            *slot = i16::MAX;
        }
        assert_eq!(gate.assess(&samples), GateDecision::Accept);
    }

    #[test]
    fn build_gate_returns_none_when_disabled() {
        assert!(build_gate(GateKind::None, -40.0, 12, 0.9).is_none());
        let gate = build_gate(GateKind::Range, -40.0, 12, 0.9).unwrap();
        assert_eq!(gate.name(), "range_gate");
    }
}
