//! Spectral-subtraction noise reduction ahead of the speech-probability model.
//!
//! ## Algorithm
//!
//! 1. FFT the analysis window.
//! 2. For the first `estimation_frames` windows, fold the magnitude spectrum
//!    into a rolling noise profile (first copy, then 0.8 old / 0.2 new) and
//!    pass the window through unchanged.
//! 3. Afterwards subtract `factor × noise` from each bin's magnitude, keep
//!    the phase, floor the result at a small fraction of the original
//!    magnitude (avoids musical-noise holes), and inverse FFT.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use crate::config::NoiseReductionConfig;

/// Residual magnitude kept for a fully-subtracted bin.
const SPECTRAL_FLOOR: f32 = 0.02;
const NOISE_DECAY: f32 = 0.8;

pub struct NoiseReducer {
    factor: f32,
    estimation_frames: u32,
    frames_seen: u32,
    noise_profile: Vec<f32>,
    plans: Option<(usize, Arc<dyn Fft<f32>>, Arc<dyn Fft<f32>>)>,
    spectrum: Vec<Complex<f32>>,
}

impl NoiseReducer {
    pub fn new(config: NoiseReductionConfig) -> Self {
        let mut config = config;
        config.normalize();
        Self {
            factor: config.factor,
            estimation_frames: config.estimation_frames,
            frames_seen: 0,
            noise_profile: Vec::new(),
            plans: None,
            spectrum: Vec::new(),
        }
    }

    /// `true` while the noise profile is still being built.
    pub fn is_estimating(&self) -> bool {
        self.frames_seen < self.estimation_frames
    }

    /// Denoise one window. The output has the same length as the input.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let n = samples.len();
        if n == 0 {
            return Vec::new();
        }

        let (forward, inverse) = self.plans_for(n);

        self.spectrum.clear();
        self.spectrum
            .extend(samples.iter().map(|&s| Complex::new(s, 0.0)));
        forward.process(&mut self.spectrum);

        if self.noise_profile.len() != n {
            // Window size changed; the old profile no longer lines up.
            self.noise_profile.clear();
            self.frames_seen = 0;
        }

        if self.is_estimating() {
            if self.noise_profile.is_empty() {
                self.noise_profile = self.spectrum.iter().map(|c| c.norm()).collect();
            } else {
                for (noise, bin) in self.noise_profile.iter_mut().zip(&self.spectrum) {
                    *noise = NOISE_DECAY * *noise + (1.0 - NOISE_DECAY) * bin.norm();
                }
            }
            self.frames_seen += 1;
            if !self.is_estimating() {
                debug!(frames = self.frames_seen, "noise profile ready");
            }
            return samples.to_vec();
        }

        for (bin, noise) in self.spectrum.iter_mut().zip(&self.noise_profile) {
            let magnitude = bin.norm();
            if magnitude <= f32::EPSILON {
                continue;
            }
            let reduced = (magnitude - self.factor * noise).max(magnitude * SPECTRAL_FLOOR);
            *bin *= reduced / magnitude;
        }

        inverse.process(&mut self.spectrum);
        let scale = 1.0 / n as f32;
        self.spectrum.iter().map(|c| c.re * scale).collect()
    }

    /// Forget the noise profile; the next windows re-estimate it.
    pub fn reset(&mut self) {
        self.frames_seen = 0;
        self.noise_profile.clear();
    }

    fn plans_for(&mut self, n: usize) -> (Arc<dyn Fft<f32>>, Arc<dyn Fft<f32>>) {
        match &self.plans {
            Some((len, fwd, inv)) if *len == n => (Arc::clone(fwd), Arc::clone(inv)),
            _ => {
                let mut planner = FftPlanner::new();
                let fwd = planner.plan_fft_forward(n);
                let inv = planner.plan_fft_inverse(n);
                self.plans = Some((n, Arc::clone(&fwd), Arc::clone(&inv)));
                (fwd, inv)
            }
        }
    }
}

impl std::fmt::Debug for NoiseReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseReducer")
            .field("factor", &self.factor)
            .field("estimation_frames", &self.estimation_frames)
            .field("frames_seen", &self.frames_seen)
            .finish_non_exhaustive()
    }
}
