//! PCM helpers shared by the VAD, the providers and the replay tool.
//!
//! Inbound audio is 16-bit signed little-endian mono at 16 kHz. Everything
//! downstream of the byte boundary works on normalized f32 in [-1.0, 1.0).

pub mod denoise;
pub mod resample;

/// Sample rate of inbound client audio and of the speech-probability model.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Decode PCM16 LE bytes into normalized floats. A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect()
}

/// Encode normalized floats as PCM16 LE, saturating out-of-range samples.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        let v = (s * 32_768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Mean absolute amplitude of a window.
pub fn mean_abs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Root-mean-square of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// PCM16 byte count for `ms` milliseconds at `sample_rate`.
pub fn bytes_for_ms(ms: u32, sample_rate: u32) -> usize {
    (sample_rate as usize * ms as usize / 1000) * BYTES_PER_SAMPLE
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pcm16_decodes_little_endian() {
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0xFF, 0x7F];
        let samples = pcm16_to_f32(&bytes);
        assert_eq!(samples.len(), 3);
        assert_relative_eq!(samples[0], 0.5);
        assert_relative_eq!(samples[1], -0.5);
        assert_relative_eq!(samples[2], 32_767.0 / 32_768.0);
    }

    #[test]
    fn odd_trailing_byte_is_dropped() {
        assert_eq!(pcm16_to_f32(&[0x00, 0x40, 0x12]).len(), 1);
    }

    #[test]
    fn encode_saturates() {
        let bytes = f32_to_pcm16(&[2.0, -2.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MIN);
    }

    #[test]
    fn energy_measures() {
        let square: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        assert_relative_eq!(rms(&square), 0.5, epsilon = 1e-5);
        assert_relative_eq!(mean_abs(&square), 0.5, epsilon = 1e-5);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn byte_durations() {
        assert_eq!(bytes_for_ms(20, 16_000), 640);
        assert_eq!(bytes_for_ms(1_000, 16_000), 32_000);
    }
}
