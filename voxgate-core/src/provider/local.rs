//! Offline providers: the local recognizer and a silent synthesizer.

use async_trait::async_trait;
use tracing::debug;

use super::{SpeechToText, TextToSpeech};
use crate::buffering::chunk::AudioChunk;
use crate::error::{Result, VoxgateError};
use crate::inference::ModelHandle;

/// STT over an in-process [`crate::inference::SpeechModel`].
///
/// Decoding is CPU-bound and blocking, so every call hops onto the blocking
/// pool; the model mutex serialises sessions sharing the recognizer.
pub struct LocalSpeechToText {
    model: ModelHandle,
}

impl LocalSpeechToText {
    /// Warms the model up before returning.
    pub fn new(model: ModelHandle) -> Result<Self> {
        model.0.lock().warm_up()?;
        Ok(Self { model })
    }
}

#[async_trait]
impl SpeechToText for LocalSpeechToText {
    fn name(&self) -> &str {
        "local"
    }

    async fn recognize(&self, pcm: &[u8]) -> Result<String> {
        let chunk = AudioChunk::from_pcm16(pcm);
        if chunk.is_empty() {
            return Ok(String::new());
        }
        let model = self.model.clone();
        let text = tokio::task::spawn_blocking(move || {
            let mut guard = model.0.lock();
            let text = guard.transcribe(&chunk);
            guard.reset();
            text
        })
        .await
        .map_err(|e| VoxgateError::Inference(format!("recognizer task failed: {e}")))??;
        debug!(chars = text.len(), "local recognition done");
        Ok(text.trim().to_string())
    }
}

/// Placeholder TTS that returns silence sized to the text, for deployments
/// without a speech engine. Keeps client-side playback timing realistic.
#[derive(Debug, Clone)]
pub struct SilentSpeech {
    sample_rate: u32,
    ms_per_char: u32,
}

impl SilentSpeech {
    pub fn new(sample_rate: u32, ms_per_char: u32) -> Self {
        Self {
            sample_rate,
            ms_per_char,
        }
    }
}

impl Default for SilentSpeech {
    fn default() -> Self {
        Self::new(16_000, 60)
    }
}

#[async_trait]
impl TextToSpeech for SilentSpeech {
    fn name(&self) -> &str {
        "silent"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let ms = (text.chars().count() as u32 * self.ms_per_char).min(10_000);
        Ok(vec![0u8; crate::audio::bytes_for_ms(ms, self.sample_rate)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::StubRecognizer;

    #[tokio::test]
    async fn local_stt_runs_the_recognizer() {
        let stt = LocalSpeechToText::new(ModelHandle::new(StubRecognizer::with_transcript(
            "  what time is it ",
        )))
        .unwrap();
        let text = stt.recognize(&vec![0u8; 3_200]).await.unwrap();
        assert_eq!(text, "what time is it");
    }

    #[tokio::test]
    async fn empty_audio_skips_the_recognizer() {
        let stt = LocalSpeechToText::new(ModelHandle::new(StubRecognizer::with_transcript("ghost")))
            .unwrap();
        assert_eq!(stt.recognize(&[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn silent_tts_scales_with_text() {
        let tts = SilentSpeech::new(16_000, 50);
        let audio = tts.synthesize("hello").await.unwrap();
        assert_eq!(audio.len(), 16_000 * 2 / 4);
        assert!(audio.iter().all(|b| *b == 0));
    }
}
