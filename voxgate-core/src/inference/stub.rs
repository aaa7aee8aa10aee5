//! `StubRecognizer`: placeholder backend that reports what it heard
//! without real inference, so the full turn pipeline can run offline.

use tracing::debug;

use crate::buffering::chunk::AudioChunk;
use crate::error::Result;
use crate::inference::SpeechModel;

/// Echo-style recognizer.
///
/// With a fixed transcript it returns that text for every utterance of
/// non-trivial length; otherwise `"[stub: <N> samples @ <SR> Hz]"`.
pub struct StubRecognizer {
    fixed: Option<String>,
    utterance_count: u32,
}

impl StubRecognizer {
    pub fn new() -> Self {
        Self {
            fixed: None,
            utterance_count: 0,
        }
    }

    pub fn with_transcript(text: impl Into<String>) -> Self {
        Self {
            fixed: Some(text.into()),
            utterance_count: 0,
        }
    }

    pub fn utterance_count(&self) -> u32 {
        self.utterance_count
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechModel for StubRecognizer {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubRecognizer::warm_up: no-op");
        Ok(())
    }

    fn transcribe(&mut self, chunk: &AudioChunk) -> Result<String> {
        // Under 10 ms of audio.
        if chunk.samples.len() < 160 {
            return Ok(String::new());
        }
        self.utterance_count += 1;
        Ok(match &self.fixed {
            Some(text) => text.clone(),
            None => format!(
                "[stub: {} samples @ {} Hz]",
                chunk.samples.len(),
                chunk.sample_rate
            ),
        })
    }

    fn reset(&mut self) {
        debug!("StubRecognizer::reset");
    }
}
