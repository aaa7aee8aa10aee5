//! Typed audio chunk handed to offline recognizers.

use crate::audio::{pcm16_to_f32, INPUT_SAMPLE_RATE};

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode a completed utterance (PCM16 LE at 16 kHz).
    pub fn from_pcm16(bytes: &[u8]) -> Self {
        Self::new(pcm16_to_f32(bytes), INPUT_SAMPLE_RATE)
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
