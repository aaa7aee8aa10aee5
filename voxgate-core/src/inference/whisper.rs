//! Offline Whisper recognizer on ONNX Runtime.
//!
//! Expects the separate encoder/decoder export in one directory:
//! - `encoder_model.onnx`: `input_features [1,80,3000]` → `last_hidden_state [1,1500,d]`
//! - `decoder_model.onnx`: `input_ids [1,seq]` + `encoder_hidden_states` → `logits [1,seq,vocab]`
//! - `tokenizer.json`
//!
//! ## Front end
//!
//! | Parameter   | Value          |
//! |-------------|----------------|
//! | Hann window | 400 samples    |
//! | Hop length  | 160 (10 ms)    |
//! | Mel bands   | 80 (slaney)    |
//! | Mel range   | 0–8 000 Hz     |
//! | Frames      | 3 000 (30 s)   |
//!
//! ## Decoder
//!
//! Greedy argmax over the full prefix every step (no key/value cache).
//! Timestamps and control tokens are suppressed; decoding stops at EOT, at a
//! token budget scaled to the audio length, or when the tail starts looping.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array3;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::{TensorRef, Value};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::SpeechModel;
use crate::audio::INPUT_SAMPLE_RATE;
use crate::buffering::chunk::AudioChunk;
use crate::error::{Result, VoxgateError};

const N_FFT: usize = 400;
const N_FREQS: usize = N_FFT / 2 + 1;
const HOP: usize = 160;
const N_MELS: usize = 80;
const N_FRAMES: usize = 3_000;
const MEL_SAMPLES: usize = 480_000;

const EOT_FALLBACK: i64 = 50257;
const SOT_FALLBACK: i64 = 50258;
const TRANSCRIBE_FALLBACK: i64 = 50359;
const NOTIMESTAMPS_FALLBACK: i64 = 50363;
/// Space token; never a good first token.
const SPACE_TOKEN: i64 = 220;

const MAX_TOKENS: usize = 224;
const MIN_TOKENS: usize = 24;
const TOKENS_PER_SECOND: f32 = 6.8;
const TOKEN_OVERHEAD: usize = 12;
const REPEAT_TOKEN_BREAK: usize = 14;

fn onnx_err(e: impl std::fmt::Display) -> VoxgateError {
    VoxgateError::OnnxSession(e.to_string())
}

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub tokenizer_path: PathBuf,
    /// Language code (`en`, `zh`, ...). `None` lets the model detect it.
    pub language: Option<String>,
}

impl WhisperConfig {
    pub fn from_dir(dir: impl AsRef<Path>, language: Option<String>) -> Self {
        let dir = dir.as_ref();
        Self {
            encoder_path: dir.join("encoder_model.onnx"),
            decoder_path: dir.join("decoder_model.onnx"),
            tokenizer_path: dir.join("tokenizer.json"),
            language,
        }
    }
}

fn create_session(path: &Path) -> Result<Session> {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, 12);
    SessionBuilder::new()
        .map_err(onnx_err)?
        .with_intra_threads(threads)
        .map_err(onnx_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(onnx_err)?
        .commit_from_file(path)
        .map_err(onnx_err)
}

/// Control tokens and the suppression rules applied at each step.
#[derive(Debug, Clone)]
struct SpecialTokens {
    eot: i64,
    timestamp_begin: Option<i64>,
    begin_suppress: Vec<i64>,
    always_suppress: Vec<i64>,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Self {
        let eot = token_id_or(tokenizer, "<|endoftext|>", EOT_FALLBACK);
        let always_suppress = [
            "<|startoftranscript|>",
            "<|translate|>",
            "<|transcribe|>",
            "<|notimestamps|>",
            "<|nospeech|>",
        ]
        .iter()
        .filter_map(|t| tokenizer.token_to_id(t).map(i64::from))
        .collect();
        Self {
            eot,
            timestamp_begin: tokenizer.token_to_id("<|0.00|>").map(i64::from),
            begin_suppress: vec![SPACE_TOKEN, eot],
            always_suppress,
        }
    }

    fn allowed(&self, token: i64, step: usize) -> bool {
        !(self.timestamp_begin.is_some_and(|tb| token >= tb)
            || self.always_suppress.contains(&token)
            || (step == 0 && self.begin_suppress.contains(&token)))
    }

    /// Best allowed token of one logit row; EOT when nothing is allowed.
    fn pick(&self, logits: &[f32], step: usize) -> i64 {
        logits
            .iter()
            .enumerate()
            .filter(|&(i, _)| self.allowed(i as i64, step))
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i as i64)
            .unwrap_or(self.eot)
    }
}

fn token_id_or(tokenizer: &Tokenizer, token: &str, fallback: i64) -> i64 {
    tokenizer
        .token_to_id(token)
        .map(i64::from)
        .unwrap_or(fallback)
}

fn decode_prefix(tokenizer: &Tokenizer, language: Option<&str>) -> Vec<i64> {
    let sot = token_id_or(tokenizer, "<|startoftranscript|>", SOT_FALLBACK);
    let transcribe = token_id_or(tokenizer, "<|transcribe|>", TRANSCRIBE_FALLBACK);
    let notimestamps = token_id_or(tokenizer, "<|notimestamps|>", NOTIMESTAMPS_FALLBACK);
    let lang = language.and_then(|l| tokenizer.token_to_id(&format!("<|{l}|>")).map(i64::from));
    match lang {
        Some(lang) => vec![sot, lang, transcribe, notimestamps],
        None => vec![sot, transcribe, notimestamps],
    }
}

pub struct WhisperModel {
    config: WhisperConfig,
    encoder: Option<Session>,
    decoder: Option<Session>,
    tokenizer: Option<Tokenizer>,
    n_mels: usize,
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl WhisperModel {
    /// Nothing is loaded until [`SpeechModel::warm_up`].
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            config,
            encoder: None,
            decoder: None,
            tokenizer: None,
            n_mels: N_MELS,
            mel_filters: build_mel_filters(N_FFT, INPUT_SAMPLE_RATE, N_MELS, 0.0, 8_000.0),
            hann_window: build_hann_window(N_FFT),
            fft: FftPlanner::<f32>::new().plan_fft_forward(N_FFT),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.encoder.is_some() && self.decoder.is_some() && self.tokenizer.is_some()
    }

    /// `samples` is exactly `MEL_SAMPLES` long; frames past `active_samples`
    /// are padding and stay at the floor.
    fn log_mel_spectrogram(&self, samples: &[f32], active_samples: usize) -> Array3<f32> {
        let mut normalized = samples.to_vec();
        normalize_rms_in_place(&mut normalized, 0.10);
        let centered = reflect_pad(&normalized, N_FFT / 2);
        let active_frames = (active_samples.min(MEL_SAMPLES) + N_FFT).div_ceil(HOP);
        let active_frames = active_frames.clamp(1, N_FRAMES);

        let mut mel = Array3::<f32>::zeros((1, self.n_mels, N_FRAMES));
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); N_FFT];

        for frame in 0..active_frames {
            let start = frame * HOP;
            for (i, slot) in fft_buf.iter_mut().enumerate() {
                *slot = Complex::new(centered[start + i] * self.hann_window[i], 0.0);
            }
            self.fft.process(&mut fft_buf);

            for (m, filter) in self.mel_filters.iter().enumerate() {
                let energy: f32 = filter
                    .iter()
                    .zip(&fft_buf[..N_FREQS])
                    .map(|(w, bin)| w * bin.norm_sqr())
                    .sum();
                mel[[0, m, frame]] = energy;
            }
        }

        mel.mapv_inplace(|v| v.max(1e-10).log10());
        let max_val = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        mel.mapv_inplace(|v| (v.max(max_val - 8.0) + 4.0) / 4.0);
        mel
    }
}

fn greedy_decode(
    decoder: &mut Session,
    enc_shape: [i64; 3],
    enc_data: &[f32],
    prefix: &[i64],
    max_steps: usize,
    special: &SpecialTokens,
) -> Result<Vec<i64>> {
    let mut tokens = prefix.to_vec();
    let mut repeated = 0usize;

    for step in 0..max_steps.clamp(1, MAX_TOKENS) {
        let seq = tokens.len();
        let next = {
            let input_ids =
                TensorRef::from_array_view(([1_i64, seq as i64], tokens.as_slice())).map_err(onnx_err)?;
            let hidden = TensorRef::from_array_view((enc_shape, enc_data)).map_err(onnx_err)?;
            let outputs = decoder
                .run(ort::inputs![
                    "input_ids"             => input_ids,
                    "encoder_hidden_states" => hidden,
                ])
                .map_err(onnx_err)?;
            let (_, logits) = outputs["logits"]
                .try_extract_tensor::<f32>()
                .map_err(onnx_err)?;
            let vocab = logits.len() / seq;
            special.pick(&logits[(seq - 1) * vocab..seq * vocab], step)
        };

        if tokens.last() == Some(&next) {
            repeated += 1;
        } else {
            repeated = 0;
        }
        tokens.push(next);

        if next == special.eot {
            break;
        }
        if repeated >= REPEAT_TOKEN_BREAK || has_repeating_tail_pattern(&tokens[prefix.len()..]) {
            debug!(step, "decode stopped on a repeating tail");
            break;
        }
    }
    Ok(tokens)
}

impl SpeechModel for WhisperModel {
    fn warm_up(&mut self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        for path in [
            &self.config.encoder_path,
            &self.config.decoder_path,
            &self.config.tokenizer_path,
        ] {
            if !path.exists() {
                return Err(VoxgateError::ModelNotFound { path: path.clone() });
            }
        }

        info!(path = %self.config.encoder_path.display(), "loading whisper encoder");
        let mut encoder = create_session(&self.config.encoder_path)?;
        if let Some(mel_bins) = encoder
            .inputs()
            .first()
            .and_then(|i| i.dtype().tensor_shape())
            .filter(|s| s.len() >= 2)
            .map(|s| s[1])
            .filter(|&bins| bins > 0 && bins as usize != self.n_mels)
        {
            info!(detected = mel_bins, "encoder expects a different mel-bin count");
            self.n_mels = mel_bins as usize;
            self.mel_filters = build_mel_filters(N_FFT, INPUT_SAMPLE_RATE, self.n_mels, 0.0, 8_000.0);
        }

        info!(path = %self.config.decoder_path.display(), "loading whisper decoder");
        let decoder = create_session(&self.config.decoder_path)?;
        let tokenizer = Tokenizer::from_file(&self.config.tokenizer_path).map_err(onnx_err)?;
        if let Some(lang) = &self.config.language {
            if tokenizer.token_to_id(&format!("<|{lang}|>")).is_none() {
                warn!(language = %lang, "tokenizer has no such language token; detecting instead");
            }
        }

        // One pass over silence so the first utterance does not pay for it.
        let dummy = Value::from_array(Array3::<f32>::zeros((1, self.n_mels, N_FRAMES)))
            .map_err(onnx_err)?;
        encoder
            .run(ort::inputs!["input_features" => dummy])
            .map_err(onnx_err)?;

        info!(vocab = tokenizer.get_vocab_size(true), "whisper ready");
        self.encoder = Some(encoder);
        self.decoder = Some(decoder);
        self.tokenizer = Some(tokenizer);
        Ok(())
    }

    fn transcribe(&mut self, chunk: &AudioChunk) -> Result<String> {
        if chunk.is_empty() {
            return Ok(String::new());
        }
        if chunk.sample_rate != INPUT_SAMPLE_RATE {
            return Err(VoxgateError::Inference(format!(
                "whisper expects {INPUT_SAMPLE_RATE} Hz audio, got {} Hz",
                chunk.sample_rate
            )));
        }
        if !self.is_loaded() {
            return Err(VoxgateError::OnnxSession("model not loaded; call warm_up()".into()));
        }

        let active = chunk.samples.len().min(MEL_SAMPLES);
        let mut samples = chunk.samples[..active].to_vec();
        samples.resize(MEL_SAMPLES, 0.0);
        let features = Value::from_array(self.log_mel_spectrogram(&samples, active)).map_err(onnx_err)?;

        let (Some(encoder), Some(decoder), Some(tokenizer)) =
            (self.encoder.as_mut(), self.decoder.as_mut(), self.tokenizer.as_ref())
        else {
            return Err(VoxgateError::OnnxSession("model not loaded; call warm_up()".into()));
        };

        let enc_out = encoder
            .run(ort::inputs!["input_features" => features])
            .map_err(onnx_err)?;
        let (shape, enc_data) = enc_out["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(onnx_err)?;
        if shape.len() < 3 {
            return Err(VoxgateError::OnnxSession(format!(
                "unexpected encoder output rank {}",
                shape.len()
            )));
        }
        let enc_shape = [1_i64, shape[1], shape[2]];

        let special = SpecialTokens::from_tokenizer(tokenizer);
        let prefix = decode_prefix(tokenizer, self.config.language.as_deref());
        let seconds = active as f32 / INPUT_SAMPLE_RATE as f32;
        let budget = ((seconds * TOKENS_PER_SECOND).ceil() as usize + TOKEN_OVERHEAD)
            .clamp(MIN_TOKENS, MAX_TOKENS);

        let tokens = greedy_decode(decoder, enc_shape, enc_data, &prefix, budget, &special)?;
        let text_ids: Vec<u32> = tokens[prefix.len()..]
            .iter()
            .take_while(|&&t| t != special.eot)
            .filter(|&&t| special.timestamp_begin.is_none_or(|tb| t < tb))
            .filter_map(|&t| u32::try_from(t).ok())
            .collect();
        if text_ids.is_empty() {
            debug!(generated = tokens.len() - prefix.len(), "no text tokens decoded");
            return Ok(String::new());
        }
        let decoded = tokenizer
            .decode(&text_ids, true)
            .map_err(|e| VoxgateError::Inference(e.to_string()))?;
        let text = postprocess_transcript_text(&decoded);
        debug!(tokens = text_ids.len(), seconds, chars = text.len(), "whisper decode done");
        Ok(text)
    }

    fn reset(&mut self) {}
}

/// Loops like `[a,b,a,b,a,b]` or `[x,x,x]` at the end of the sequence.
fn has_repeating_tail_pattern(generated: &[i64]) -> bool {
    let len = generated.len();
    (1..=8).filter(|n| len >= n * 3).any(|n| {
        let a = &generated[len - n..];
        let b = &generated[len - 2 * n..len - n];
        let c = &generated[len - 3 * n..len - 2 * n];
        a == b && b == c
    })
}

fn postprocess_transcript_text(text: &str) -> String {
    let mut compact = String::with_capacity(text.len());
    let mut prev_was_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            if !prev_was_space {
                compact.push(' ');
            }
            prev_was_space = true;
            continue;
        }
        if matches!(ch, '.' | ',' | '!' | '?' | ';' | ':') && compact.ends_with(' ') {
            compact.pop();
        }
        compact.push(ch);
        prev_was_space = false;
    }

    // Decoder restarts leave stray leading punctuation.
    let out = compact
        .trim()
        .trim_start_matches(|ch: char| matches!(ch, ',' | ';' | ':' | '.' | '!' | '?'))
        .trim_start()
        .split_whitespace()
        .map(|w| if w == "i" { "I" } else { w })
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = capitalize_sentence_starts(&out);

    let has_terminal = out.ends_with(['.', '!', '?']);
    if !has_terminal && out.split_whitespace().count() >= 8 {
        out.push('.');
    }
    out
}

fn capitalize_sentence_starts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cap_next = true;
    for ch in text.chars() {
        if cap_next && ch.is_ascii_alphabetic() {
            out.push(ch.to_ascii_uppercase());
            cap_next = false;
        } else {
            out.push(ch);
            if ch.is_alphanumeric() {
                cap_next = false;
            }
        }
        if matches!(ch, '.' | '!' | '?') {
            cap_next = true;
        }
    }
    out
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Slaney-normalized triangular filters, `n_mels` rows of `fft_size / 2 + 1`.
fn build_mel_filters(fft_size: usize, sr: u32, n_mels: usize, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);
    let hz_pts: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (hz_pts[m], hz_pts[m + 1], hz_pts[m + 2]);
            let enorm = 2.0 / (upper - lower).max(1e-10);
            (0..n_freqs)
                .map(|k| {
                    let freq = k as f32 * sr as f32 / fft_size as f32;
                    let w = if freq >= lower && freq <= center {
                        (freq - lower) / (center - lower).max(1e-10)
                    } else if freq > center && freq <= upper {
                        (upper - freq) / (upper - center).max(1e-10)
                    } else {
                        0.0
                    };
                    (w * enorm).max(0.0)
                })
                .collect()
        })
        .collect()
}

fn normalize_rms_in_place(samples: &mut [f32], target_rms: f32) {
    if samples.is_empty() {
        return;
    }
    let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
    if rms <= 1e-6 {
        return;
    }
    let gain = (target_rms / rms).clamp(0.8, 15.0);
    if (gain - 1.0).abs() < 1e-3 {
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    match samples.len() {
        _ if pad == 0 => samples.to_vec(),
        0 => vec![0.0; pad * 2],
        1 => vec![samples[0]; 1 + pad * 2],
        len => (-(pad as isize)..(len + pad) as isize)
            .map(|i| samples[reflect_index(i, len)])
            .collect(),
    }
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        i = if i < 0 { -i } else { 2 * max - i };
    }
    i as usize
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let logstep = 6.4_f32.ln() / 27.0;
    if hz >= min_log_hz {
        min_log_hz / f_sp + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4_f32.ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn missing_files_are_reported_by_path() {
        let mut model = WhisperModel::new(WhisperConfig::from_dir("/nonexistent/whisper", None));
        match model.warm_up() {
            Err(VoxgateError::ModelNotFound { path }) => {
                assert!(path.ends_with("encoder_model.onnx"), "{}", path.display());
            }
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
        assert!(!model.is_loaded());
    }

    #[test]
    fn transcribe_requires_warm_up() {
        let mut model = WhisperModel::new(WhisperConfig::from_dir("/nonexistent/whisper", None));
        assert_eq!(model.transcribe(&AudioChunk::new(Vec::new(), 16_000)).unwrap(), "");
        let err = model
            .transcribe(&AudioChunk::new(vec![0.1; 1_600], 16_000))
            .unwrap_err();
        assert!(matches!(err, VoxgateError::OnnxSession(_)));
        let err = model
            .transcribe(&AudioChunk::new(vec![0.1; 800], 8_000))
            .unwrap_err();
        assert!(matches!(err, VoxgateError::Inference(_)));
    }

    #[test]
    fn silence_gives_a_flat_spectrogram() {
        let model = WhisperModel::new(WhisperConfig::from_dir("unused", None));
        let mel = model.log_mel_spectrogram(&vec![0.0; MEL_SAMPLES], 16_000);
        assert_eq!(mel.shape(), &[1, N_MELS, N_FRAMES]);
        assert!(mel.iter().all(|&v| (v - -1.5).abs() < 1e-6));
    }

    #[test]
    fn tone_energy_lands_in_the_matching_band() {
        let model = WhisperModel::new(WhisperConfig::from_dir("unused", None));
        let mut samples: Vec<f32> = (0..16_000)
            .map(|i| (2.0 * std::f32::consts::PI * 1_000.0 * i as f32 / 16_000.0).sin() * 0.3)
            .collect();
        samples.resize(MEL_SAMPLES, 0.0);
        let mel = model.log_mel_spectrogram(&samples, 16_000);

        let frame = 50;
        let loudest = (0..N_MELS)
            .max_by(|&a, &b| mel[[0, a, frame]].total_cmp(&mel[[0, b, frame]]))
            .unwrap();
        // 1 kHz is 15 slaney mels, the centre of band 26 of 80.
        assert!((23..=29).contains(&loudest), "loudest band {loudest}");
    }

    #[test]
    fn mel_filters_are_slaney_triangles() {
        let filters = build_mel_filters(N_FFT, 16_000, N_MELS, 0.0, 8_000.0);
        assert_eq!(filters.len(), N_MELS);
        assert!(filters.iter().all(|f| f.len() == N_FREQS));
        assert!(filters.iter().all(|f| f.iter().any(|&w| w > 0.0)));
        assert!(filters.iter().flatten().all(|&w| w >= 0.0));
        assert_relative_eq!(mel_to_hz_slaney(hz_to_mel_slaney(4_321.0)), 4_321.0, max_relative = 1e-4);
        assert_relative_eq!(hz_to_mel_slaney(1_000.0), 15.0, max_relative = 1e-5);
    }

    #[test]
    fn reflect_pad_mirrors_without_repeating_the_edge() {
        assert_eq!(
            reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2),
            [3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]
        );
        assert_eq!(reflect_pad(&[7.0], 2), [7.0; 5]);
        assert_eq!(reflect_pad(&[], 1), [0.0, 0.0]);
    }

    #[test]
    fn suppressed_and_timestamp_tokens_are_never_picked() {
        let special = SpecialTokens {
            eot: 3,
            timestamp_begin: Some(5),
            begin_suppress: vec![3],
            always_suppress: vec![1],
        };
        let logits = [0.0, 9.0, 1.0, 5.0, 2.0, 8.0];
        assert_eq!(special.pick(&logits, 0), 4);
        assert_eq!(special.pick(&logits, 1), 3);
        assert_eq!(special.pick(&[0.0, 1.0], 1), 0);
    }

    #[test]
    fn repeating_tails_are_detected() {
        assert!(has_repeating_tail_pattern(&[9, 1, 2, 1, 2, 1, 2]));
        assert!(has_repeating_tail_pattern(&[5, 5, 5]));
        assert!(!has_repeating_tail_pattern(&[1, 2, 3, 1, 2]));
        assert!(!has_repeating_tail_pattern(&[]));
    }

    #[test]
    fn transcript_text_is_tidied() {
        assert_eq!(
            postprocess_transcript_text("  , hello , i think so .  "),
            "Hello, I think so."
        );
        assert_eq!(
            postprocess_transcript_text("this is a sentence with more than eight words here"),
            "This is a sentence with more than eight words here."
        );
        assert_eq!(postprocess_transcript_text("ok. sure"), "Ok. Sure");
        assert_eq!(postprocess_transcript_text("   "), "");
    }
}
