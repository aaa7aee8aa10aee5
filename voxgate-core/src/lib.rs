//! # voxgate-core
//!
//! Real-time voice-assistant gateway core.
//!
//! ## Architecture
//!
//! ```text
//! client PCM ─► SessionHandle ─► session actor
//!                                   │
//!                        VadSession (spawn_blocking)
//!                                   │ utterance
//!                          SpeechToText ─► LanguageModel ⇄ ToolRegistry
//!                                                │ reply
//!                                          TextToSpeech
//!                                                │
//!                          mpsc::UnboundedSender<OutboundFrame> ─► client
//! ```
//!
//! Provider instances are built by named factories and cached per
//! configuration in a concurrent map shared by every session.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ipc;
pub mod provider;
pub mod tools;
pub mod vad;

// Convenience re-exports for downstream crates
pub use config::{
    DialogueConfig, GatewayConfig, LocalSttConfig, NoiseReductionConfig, ProviderDefaults, VadConfig,
};
pub use conversation::{ConnectionHandle, ConversationContext};
pub use engine::{load_recognizer, DiagnosticsSnapshot, Gateway, SessionHandle, SessionOptions};
pub use error::{Result, VoxgateError};
pub use inference::{ModelHandle, SpeechModel, StubRecognizer};
pub use ipc::events::{OutboundFrame, ServerMessage};
pub use provider::{
    ChatDelta, ChatMessage, ChatReply, ChatStream, LanguageModel, ProviderConfig, ProviderKind,
    Providers, SpeechToText, TextToSpeech,
};
pub use tools::{ActionType, ToolDescriptor, ToolOutcome, ToolRegistry, ToolType};
pub use vad::{EnergyModel, SessionModel, SpeechProbabilityModel, VadOutcome, VadSession};

#[cfg(feature = "onnx")]
pub use inference::{WhisperConfig, WhisperModel};
#[cfg(feature = "onnx")]
pub use vad::SileroModel;
