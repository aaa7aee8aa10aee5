//! Offline speech recognizer abstraction.
//!
//! The `SpeechModel` trait decouples the local STT provider from any specific
//! backend (stub echo, Vosk, Whisper, etc.).
//!
//! `&mut self` on `transcribe` expresses that decoders are stateful, so all
//! mutation is serialised through `ModelHandle`'s `parking_lot::Mutex`. Calls
//! are blocking; async callers go through `spawn_blocking`.

pub mod stub;
#[cfg(feature = "onnx")]
pub mod whisper;

pub use stub::StubRecognizer;
#[cfg(feature = "onnx")]
pub use whisper::{WhisperConfig, WhisperModel};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffering::chunk::AudioChunk;
use crate::error::Result;

/// Contract for offline speech recognition backends.
pub trait SpeechModel: Send + 'static {
    /// One-time warm-up: load weights, run a dummy inference. Called once
    /// when the default STT provider is initialised at gateway startup.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Transcribe one complete utterance. Returns an empty string when
    /// nothing intelligible was heard.
    fn transcribe(&mut self, chunk: &AudioChunk) -> Result<String>;

    /// Reset decoder state between utterances.
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `SpeechModel` implementor.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn SpeechModel>>);

impl ModelHandle {
    pub fn new<M: SpeechModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}
