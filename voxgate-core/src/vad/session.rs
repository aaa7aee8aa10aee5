//! Per-connection VAD state machine.
//!
//! ## Per chunk
//!
//! ```text
//! bytes ─► preBuffer (rolling, ≈1 s) ──┐
//!   │                                   ├─ last window ─► denoise ─► model ─► probability
//!   └─► mainBuffer (only while speaking)┘
//! ```
//!
//! Idle → Speaking after `min_speech_frames` consecutive windows above the
//! threshold; the pre-buffer is copied into the utterance so the onset is
//! kept. Speaking → Idle once `silence frames × frame_duration_ms` exceeds
//! `silence_timeout_ms`; the whole utterance is returned and the session
//! buffers are cleared. The model's recurrent state survives utterance
//! boundaries and is only zeroed by [`VadSession::reset_session`].

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace};

use super::SessionModel;
use crate::audio::{denoise::NoiseReducer, mean_abs, pcm16_to_f32};
use crate::buffering::PreBuffer;
use crate::config::VadConfig;

const ENERGY_DECAY: f32 = 0.95;

/// What one `process_audio` call observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadOutcome {
    /// Not speaking.
    Idle,
    /// This chunk confirmed a speech onset.
    SpeechStarted,
    /// Mid-utterance.
    Speaking,
    /// The utterance ended; all bytes since the onset (pre-buffer included).
    Utterance(Vec<u8>),
}

pub struct VadSession {
    config: VadConfig,
    model: SessionModel,
    denoiser: Option<NoiseReducer>,
    pre_buffer: PreBuffer,
    main_buffer: Vec<u8>,
    probability_history: VecDeque<f32>,
    consecutive_speech_frames: u32,
    silence_frame_count: u32,
    frame_count: u64,
    average_energy: f32,
    speaking: bool,
    last_speech_at: Option<Instant>,
    /// Odd byte left over from the previous chunk.
    carry: Option<u8>,
}

impl VadSession {
    pub fn new(config: VadConfig, model: SessionModel) -> Self {
        let denoiser = config.noise_reduction.map(NoiseReducer::new);
        let pre_buffer = PreBuffer::new(config.pre_buffer_bytes.max(config.window_bytes()));
        Self {
            probability_history: VecDeque::with_capacity(config.history_len),
            config,
            model,
            denoiser,
            pre_buffer,
            main_buffer: Vec::new(),
            consecutive_speech_frames: 0,
            silence_frame_count: 0,
            frame_count: 0,
            average_energy: 0.0,
            speaking: false,
            last_speech_at: None,
            carry: None,
        }
    }

    /// Feed one inbound chunk. Chunks may be any size, including odd byte
    /// counts; a split sample is completed by the next chunk.
    pub fn process_audio(&mut self, chunk: &[u8]) -> VadOutcome {
        let joined: Vec<u8>;
        let mut data = chunk;
        if let Some(b) = self.carry.take() {
            joined = [&[b][..], chunk].concat();
            data = &joined;
        }
        if data.len() % 2 == 1 {
            self.carry = data.last().copied();
            data = &data[..data.len() - 1];
        }
        if data.is_empty() {
            return self.resting_outcome();
        }

        self.pre_buffer.push(data);
        if self.speaking {
            self.main_buffer.extend_from_slice(data);
        }

        let Some(window) = self.pre_buffer.tail(self.config.window_bytes()) else {
            return self.resting_outcome();
        };

        let prob = self.analyse(&window);
        self.step(prob)
    }

    /// Denoise, measure and score the most recent window.
    fn analyse(&mut self, window: &[u8]) -> f32 {
        let mut samples = pcm16_to_f32(window);
        if let Some(nr) = self.denoiser.as_mut() {
            samples = nr.process(&samples);
        }

        let energy = mean_abs(&samples);
        self.average_energy = if self.frame_count == 0 {
            energy
        } else {
            ENERGY_DECAY * self.average_energy + (1.0 - ENERGY_DECAY) * energy
        };
        self.frame_count += 1;

        let prob = self.model.speech_probability(&samples);
        if self.probability_history.len() == self.config.history_len {
            self.probability_history.pop_front();
        }
        self.probability_history.push_back(prob);
        prob
    }

    fn step(&mut self, prob: f32) -> VadOutcome {
        if prob > self.config.speech_threshold {
            self.consecutive_speech_frames += 1;
            self.last_speech_at = Some(Instant::now());
            if self.speaking {
                self.silence_frame_count = 0;
            }
        } else {
            self.consecutive_speech_frames = 0;
            self.silence_frame_count += 1;
        }

        if !self.speaking {
            if self.consecutive_speech_frames >= self.config.min_speech_frames {
                self.speaking = true;
                self.main_buffer = self.pre_buffer.to_vec();
                self.silence_frame_count = 0;
                debug!(
                    onset_bytes = self.main_buffer.len(),
                    prob,
                    avg_energy = self.average_energy,
                    "speech started"
                );
                return VadOutcome::SpeechStarted;
            }
            return VadOutcome::Idle;
        }

        let silence_ms = self.silence_frame_count as u64 * self.config.frame_duration_ms as u64;
        trace!(prob, silence_ms, "speaking");
        if silence_ms > self.config.silence_timeout_ms as u64 {
            let utterance = std::mem::take(&mut self.main_buffer);
            debug!(bytes = utterance.len(), silence_ms, "speech ended");
            self.clear_buffers();
            return VadOutcome::Utterance(utterance);
        }
        VadOutcome::Speaking
    }

    fn resting_outcome(&self) -> VadOutcome {
        if self.speaking {
            VadOutcome::Speaking
        } else {
            VadOutcome::Idle
        }
    }

    /// Clears buffers and counters; the model state is kept.
    fn clear_buffers(&mut self) {
        self.pre_buffer.clear();
        self.main_buffer = Vec::new();
        self.probability_history.clear();
        self.consecutive_speech_frames = 0;
        self.silence_frame_count = 0;
        self.frame_count = 0;
        self.average_energy = 0.0;
        self.speaking = false;
        self.last_speech_at = None;
        self.carry = None;
    }

    /// End the current utterance now, regardless of silence. Returns the
    /// accumulated audio if speech was in progress.
    pub fn force_end(&mut self) -> Option<Vec<u8>> {
        let utterance = if self.speaking && !self.main_buffer.is_empty() {
            Some(std::mem::take(&mut self.main_buffer))
        } else {
            None
        };
        self.clear_buffers();
        utterance
    }

    /// Clear everything and zero the model's recurrent state.
    pub fn reset_session(&mut self) {
        self.clear_buffers();
        self.model.reset();
        if let Some(nr) = self.denoiser.as_mut() {
            nr.reset();
        }
    }

    /// Drop buffers and the recurrent state at session teardown. The shared
    /// model itself stays loaded for other sessions.
    pub fn close(&mut self) {
        self.clear_buffers();
        self.main_buffer.shrink_to_fit();
        self.model.reset();
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Most recent window probability, 0.0 before the first window.
    pub fn current_speech_probability(&self) -> f32 {
        self.probability_history.back().copied().unwrap_or(0.0)
    }

    pub fn probability_history(&self) -> impl Iterator<Item = f32> + '_ {
        self.probability_history.iter().copied()
    }

    pub fn average_energy(&self) -> f32 {
        self.average_energy
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_speech_at(&self) -> Option<Instant> {
        self.last_speech_at
    }

    pub fn pre_buffer_len(&self) -> usize {
        self.pre_buffer.len()
    }

    pub fn pre_buffer_capacity(&self) -> usize {
        self.pre_buffer.capacity()
    }

    pub fn main_buffer_len(&self) -> usize {
        self.main_buffer.len()
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn model(&self) -> &SessionModel {
        &self.model
    }
}

impl std::fmt::Debug for VadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadSession")
            .field("speaking", &self.speaking)
            .field("pre_buffer", &self.pre_buffer)
            .field("main_buffer_len", &self.main_buffer.len())
            .field("frame_count", &self.frame_count)
            .finish_non_exhaustive()
    }
}
