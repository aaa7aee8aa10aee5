//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Two producers of off-rate audio exist: cloud TTS engines that synthesize
//! at their own native rate (24 kHz for the OpenAI speech endpoint) and WAV
//! files fed to the replay tool. Both are brought to the gateway's rate here.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.
//!
//! ```ignore
//! let mut rc = RateConverter::new(24_000, 16_000, 960)?;
//! let mut out = rc.process(&tts_samples);
//! out.extend(rc.finish());
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoxgateError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// # Errors
    /// Returns `VoxgateError::Audio` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio: 1.0,
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| VoxgateError::Audio(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(source_rate, target_rate, chunk_size, max_out, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated until a full `chunk_size` block is available;
    /// any remainder is kept for the next call or for [`finish`](Self::finish).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Flush the buffered remainder by zero-padding it to a full chunk and
    /// trimming the output to the remainder's proportional length.
    pub fn finish(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            self.input_buf.clear();
            return Vec::new();
        }
        let pending = self.input_buf.len();
        let pad = self.chunk_size - pending;
        let mut out = self.process(&vec![0.0; pad]);
        let keep = ((pending as f64) * self.ratio).round() as usize;
        out.truncate(keep);
        out
    }

    /// Returns `true` when source rate == target rate.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Resample a complete buffer in one go.
pub fn resample_all(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    let mut rc = RateConverter::new(source_rate, target_rate, 960)?;
    let mut out = rc.process(samples);
    out.extend(rc.finish());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.finish().is_empty());
    }

    #[test]
    fn ratio_24k_to_16k_correct_length() {
        let mut rc = RateConverter::new(24_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 960]);
        let expected = 640usize;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 10,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn partial_input_is_held_until_finish() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        let tail = rc.finish();
        assert!(!tail.is_empty());
        assert!(tail.len() <= 170, "tail len={}", tail.len());
    }

    #[test]
    fn resample_all_covers_whole_input() {
        let out = resample_all(&vec![0.0f32; 4_800], 48_000, 16_000).unwrap();
        assert!(
            (out.len() as isize - 1_600).unsigned_abs() <= 20,
            "len={}",
            out.len()
        );
    }
}
