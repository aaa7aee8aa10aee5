//! Gateway configuration (JSON, camelCase, every field optional).
//!
//! Values that are absent fall back to [`Default`]; `normalize()` clamps the
//! tunables into ranges the VAD and dialogue loop can work with.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::provider::ProviderConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct GatewayConfig {
    pub vad: VadConfig,
    pub dialogue: DialogueConfig,
    pub providers: ProviderDefaults,
    /// Path to a Silero ONNX model. `None` uses the energy model.
    pub silero_model_path: Option<std::path::PathBuf>,
    pub local_stt: LocalSttConfig,
}

/// Offline recognizer behind the `local` STT provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct LocalSttConfig {
    /// Directory holding `encoder_model.onnx`, `decoder_model.onnx` and
    /// `tokenizer.json`. `None` uses the stub recognizer.
    pub model_dir: Option<std::path::PathBuf>,
    /// Whisper language code such as `en` or `zh`; detected when absent.
    pub language: Option<String>,
}

/// Tunables for one [`crate::vad::VadSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VadConfig {
    /// Probability above which a window counts as speech.
    pub speech_threshold: f32,
    /// Consecutive speech windows required before Idle → Speaking.
    pub min_speech_frames: u32,
    /// Nominal duration of one analysed frame, used to turn silent frame
    /// counts into elapsed silence.
    pub frame_duration_ms: u32,
    /// Samples per model window (512 at 16 kHz).
    pub window_samples: usize,
    /// Silence that ends an utterance.
    pub silence_timeout_ms: u32,
    /// Rolling onset buffer size in bytes (32 000 ≈ 1 s of PCM16 @ 16 kHz).
    pub pre_buffer_bytes: usize,
    /// Probabilities kept for diagnostics.
    pub history_len: usize,
    pub noise_reduction: Option<NoiseReductionConfig>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.5,
            min_speech_frames: 3,
            frame_duration_ms: 30,
            window_samples: 512,
            silence_timeout_ms: 500,
            pre_buffer_bytes: 32_000,
            history_len: 10,
            noise_reduction: Some(NoiseReductionConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct NoiseReductionConfig {
    /// Over-subtraction factor applied to the noise estimate.
    pub factor: f32,
    /// Leading windows used to build the noise profile.
    pub estimation_frames: u32,
}

impl Default for NoiseReductionConfig {
    fn default() -> Self {
        Self {
            factor: 1.5,
            estimation_frames: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DialogueConfig {
    pub system_prompt: String,
    /// History messages kept per session (trimmed in user/assistant pairs).
    pub max_history_turns: usize,
    /// Upper bound on REQLLM re-submissions within one turn.
    pub max_tool_rounds: u32,
    /// Sample rate of PCM sent back to the client.
    pub output_sample_rate: u32,
    pub apology_text: String,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant. Keep answers short and conversational."
                .into(),
            max_history_turns: 10,
            max_tool_rounds: 3,
            output_sample_rate: 16_000,
            apology_text: "Sorry, I ran into a problem handling that. Please try again.".into(),
        }
    }
}

/// Process-wide default provider names and their configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ProviderDefaults {
    pub stt: String,
    pub tts: String,
    pub llm: String,
    pub stt_config: Option<ProviderConfig>,
    pub tts_config: Option<ProviderConfig>,
    pub llm_config: Option<ProviderConfig>,
}

impl Default for ProviderDefaults {
    fn default() -> Self {
        Self {
            stt: "local".into(),
            tts: "silent".into(),
            llm: "openai".into(),
            stt_config: None,
            tts_config: None,
            llm_config: None,
        }
    }
}

impl GatewayConfig {
    /// Read a JSON config file and normalize it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut cfg: GatewayConfig = serde_json::from_str(&raw)?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn normalize(&mut self) {
        self.vad.normalize();
        self.dialogue.normalize();
        self.providers.normalize();
        self.local_stt.normalize();
    }
}

impl LocalSttConfig {
    pub fn normalize(&mut self) {
        self.language = self
            .language
            .as_ref()
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty() && l != "auto");
    }
}

impl VadConfig {
    pub fn normalize(&mut self) {
        self.speech_threshold = self.speech_threshold.clamp(0.05, 0.95);
        self.min_speech_frames = self.min_speech_frames.clamp(1, 20);
        self.frame_duration_ms = self.frame_duration_ms.clamp(10, 100);
        self.window_samples = self.window_samples.clamp(256, 1536);
        self.silence_timeout_ms = self.silence_timeout_ms.clamp(100, 10_000);
        // PCM16 samples must never be split when the oldest bytes are evicted.
        self.pre_buffer_bytes = (self.pre_buffer_bytes.max(self.window_samples * 2) + 1) & !1;
        self.history_len = self.history_len.clamp(1, 100);
        if let Some(nr) = self.noise_reduction.as_mut() {
            nr.normalize();
        }
    }

    /// Window length in bytes of PCM16.
    pub fn window_bytes(&self) -> usize {
        self.window_samples * 2
    }
}

impl NoiseReductionConfig {
    pub fn normalize(&mut self) {
        self.factor = self.factor.clamp(1.0, 3.0);
        self.estimation_frames = self.estimation_frames.clamp(1, 50);
    }
}

impl DialogueConfig {
    pub fn normalize(&mut self) {
        self.max_history_turns = self.max_history_turns.clamp(2, 50);
        self.max_tool_rounds = self.max_tool_rounds.clamp(1, 10);
        self.output_sample_rate = self.output_sample_rate.clamp(8_000, 48_000);
        if self.apology_text.trim().is_empty() {
            self.apology_text = DialogueConfig::default().apology_text;
        }
    }
}

impl ProviderDefaults {
    pub fn normalize(&mut self) {
        for name in [&mut self.stt, &mut self.tts, &mut self.llm] {
            *name = name.trim().to_ascii_lowercase();
        }
        let defaults = ProviderDefaults::default();
        if self.stt.is_empty() {
            self.stt = defaults.stt;
        }
        if self.tts.is_empty() {
            self.tts = defaults.tts;
        }
        if self.llm.is_empty() {
            self.llm = defaults.llm;
        }
        for cfg in [
            &mut self.stt_config,
            &mut self.tts_config,
            &mut self.llm_config,
        ]
        .into_iter()
        .flatten()
        {
            cfg.normalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg: GatewayConfig = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(cfg.vad.min_speech_frames, 3);
        assert_eq!(cfg.vad.frame_duration_ms, 30);
        assert_eq!(cfg.vad.window_samples, 512);
        assert_eq!(cfg.vad.pre_buffer_bytes, 32_000);
        assert_eq!(cfg.dialogue.max_history_turns, 10);
        assert_eq!(cfg.providers.stt, "local");
        assert!(cfg.vad.noise_reduction.is_some());
    }

    #[test]
    fn camel_case_fields_are_read() {
        let json = r#"{
            "vad": { "speechThreshold": 0.6, "silenceTimeoutMs": 800, "noiseReduction": null },
            "providers": { "llm": " Ollama ", "llmConfig": { "provider": "ollama", "configId": 7 } }
        }"#;
        let mut cfg: GatewayConfig = serde_json::from_str(json).expect("parse config");
        cfg.normalize();
        assert!((cfg.vad.speech_threshold - 0.6).abs() < 1e-6);
        assert_eq!(cfg.vad.silence_timeout_ms, 800);
        assert!(cfg.vad.noise_reduction.is_none());
        assert_eq!(cfg.providers.llm, "ollama");
        let llm = cfg.providers.llm_config.expect("llm config");
        assert_eq!(llm.config_id, Some(7));
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut cfg = GatewayConfig::default();
        cfg.vad.speech_threshold = 4.0;
        cfg.vad.min_speech_frames = 0;
        cfg.vad.pre_buffer_bytes = 1_001;
        cfg.vad.noise_reduction = Some(NoiseReductionConfig {
            factor: 9.0,
            estimation_frames: 0,
        });
        cfg.dialogue.max_history_turns = 0;
        cfg.normalize();

        assert!((cfg.vad.speech_threshold - 0.95).abs() < 1e-6);
        assert_eq!(cfg.vad.min_speech_frames, 1);
        assert_eq!(cfg.vad.pre_buffer_bytes % 2, 0);
        assert!(cfg.vad.pre_buffer_bytes >= cfg.vad.window_bytes());
        let nr = cfg.vad.noise_reduction.expect("noise reduction kept");
        assert!((nr.factor - 3.0).abs() < 1e-6);
        assert_eq!(nr.estimation_frames, 1);
        assert_eq!(cfg.dialogue.max_history_turns, 2);
    }

    #[test]
    fn local_stt_language_is_normalized() {
        let json = r#"{ "localStt": { "modelDir": "/models/whisper-base", "language": " EN " } }"#;
        let mut cfg: GatewayConfig = serde_json::from_str(json).expect("parse config");
        cfg.normalize();
        assert_eq!(
            cfg.local_stt.model_dir.as_deref(),
            Some(Path::new("/models/whisper-base"))
        );
        assert_eq!(cfg.local_stt.language.as_deref(), Some("en"));

        cfg.local_stt.language = Some("auto".into());
        cfg.normalize();
        assert!(cfg.local_stt.language.is_none());
    }
}
