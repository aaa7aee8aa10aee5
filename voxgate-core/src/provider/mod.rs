//! Speech-to-text, text-to-speech and language-model back-ends.
//!
//! One capability trait per kind, object-safe through `async_trait`, so a
//! session holds `Arc<dyn SpeechToText>` and never knows which vendor sits
//! behind it. Instances are created and cached by [`registry::ProviderRegistry`].

pub mod chat;
pub mod local;
pub mod registry;

#[cfg(feature = "cloud")]
pub mod openai;

pub use chat::{ChatDelta, ChatMessage, ChatReply, FunctionCall, ToolCall};
pub use registry::{ProviderKey, ProviderRegistry, Providers};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stt,
    Tts,
    Llm,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProviderKind::Stt => "stt",
            ProviderKind::Tts => "tts",
            ProviderKind::Llm => "llm",
        })
    }
}

/// Per-session provider configuration handed over by the persistence layer.
/// `None` means "use the process default" for that field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ProviderConfig {
    pub provider: String,
    pub config_id: Option<i64>,
    pub endpoint: Option<String>,
    pub app_id: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_config_id(mut self, id: i64) -> Self {
        self.config_id = Some(id);
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Cache discriminator: the config id, or `"default"`.
    pub fn cache_id(&self) -> String {
        self.config_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "default".into())
    }

    pub fn normalize(&mut self) {
        self.provider = self.provider.trim().to_ascii_lowercase();
        for field in [
            &mut self.endpoint,
            &mut self.app_id,
            &mut self.api_key,
            &mut self.api_secret,
            &mut self.model,
            &mut self.voice,
        ] {
            *field = field
                .as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }
    }
}

/// Inbound PCM16 chunks for streaming recognition.
pub type AudioStream = BoxStream<'static, Vec<u8>>;

/// Streamed chat completion.
pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

/// Outbound synthesized audio chunks (PCM16 LE at the provider's rate).
pub type SpeechStream = BoxStream<'static, Result<Vec<u8>>>;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `recognize_stream` consumes audio incrementally.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Recognize one complete utterance (PCM16 LE, 16 kHz mono).
    async fn recognize(&self, pcm: &[u8]) -> Result<String>;

    /// Recognize from a lazy chunk sequence. The default collects the stream
    /// and calls [`recognize`](Self::recognize).
    async fn recognize_stream(&self, mut audio: AudioStream) -> Result<String> {
        let mut pcm = Vec::new();
        while let Some(chunk) = audio.next().await {
            pcm.extend_from_slice(&chunk);
        }
        self.recognize(&pcm).await
    }
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &str;

    /// Native rate of the PCM16 this provider produces.
    fn sample_rate(&self) -> u32;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Synthesize the whole sentence at once.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Synthesize as a lazy chunk sequence. The default yields the one-shot
    /// result as a single chunk.
    async fn synthesize_stream(&self, text: &str) -> Result<SpeechStream> {
        let audio = self.synthesize(text).await?;
        Ok(stream::once(async move { Ok(audio) }).boxed())
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// One chat completion. `tools` are function schemas in the
    /// `{type:"function", function:{..}}` shape; empty disables tool calling.
    async fn chat(&self, messages: &[ChatMessage], tools: &[serde_json::Value]) -> Result<ChatReply>;

    /// Whether `chat_stream` yields text before the completion is finished.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Streamed completion. The default runs [`chat`](Self::chat) and yields
    /// the finished reply.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<ChatStream> {
        let reply = self.chat(messages, tools).await?;
        Ok(stream::iter(reply.into_deltas().into_iter().map(Ok)).boxed())
    }
}
