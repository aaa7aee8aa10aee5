//! Energy-based speech probability.
//!
//! Maps window RMS linearly onto [0, 1]: a window at the reference level
//! scores 0.5, twice the reference or louder scores 1.0. Stateless, so the
//! recurrent state passes through untouched.

use super::{SpeechModelState, SpeechProbabilityModel};
use crate::audio::rms;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EnergyModel {
    /// RMS that maps to probability 0.5.
    /// Typical range: 0.01–0.05 for a quiet microphone.
    reference_rms: f32,
    window: usize,
}

impl EnergyModel {
    pub fn new(reference_rms: f32, window: usize) -> Self {
        Self {
            reference_rms: reference_rms.max(1e-4),
            window: window.max(1),
        }
    }

    pub fn probability_for(&self, samples: &[f32]) -> f32 {
        (rms(samples) / (2.0 * self.reference_rms)).clamp(0.0, 1.0)
    }
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self::new(0.02, 512)
    }
}

impl SpeechProbabilityModel for EnergyModel {
    fn window_samples(&self) -> usize {
        self.window
    }

    fn infer(&self, window: &[f32], state: &SpeechModelState) -> Result<(f32, SpeechModelState)> {
        Ok((self.probability_for(window), state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn silence_scores_zero() {
        let m = EnergyModel::default();
        assert_eq!(m.probability_for(&[0.0; 512]), 0.0);
        assert_eq!(m.probability_for(&[]), 0.0);
    }

    #[test]
    fn reference_level_scores_half() {
        let m = EnergyModel::new(0.02, 512);
        assert_relative_eq!(m.probability_for(&[0.02; 512]), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn loud_window_saturates() {
        let m = EnergyModel::default();
        let (p, _) = m
            .infer(&[0.5; 512], &SpeechModelState::zeroed())
            .expect("energy inference never fails");
        assert_eq!(p, 1.0);
    }
}
