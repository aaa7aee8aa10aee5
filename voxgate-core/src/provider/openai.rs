//! OpenAI-compatible cloud providers.
//!
//! The chat-completion wire format is shared by a long list of vendors, so
//! one [`OpenAiCompatLlm`] serves all of them with a different default
//! endpoint and model. Speech endpoints follow OpenAI's
//! `/audio/transcriptions` (multipart WAV upload) and `/audio/speech`
//! (raw PCM response) contracts.
//!
//! Streamed chat completions arrive as server-sent events: one `data:` line
//! per chunk, `[DONE]` at the end. Text deltas are forwarded as they come;
//! tool-call fragments are keyed by their `index` and released whole once
//! the stream ends.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::registry::Providers;
use super::{
    ChatDelta, ChatMessage, ChatReply, ChatStream, LanguageModel, ProviderConfig, SpeechStream,
    SpeechToText, TextToSpeech, ToolCall,
};
use crate::audio::INPUT_SAMPLE_RATE;
use crate::error::{Result, VoxgateError};

/// `(name, default endpoint, default model, key required)`.
const LLM_VENDORS: &[(&str, &str, &str, bool)] = &[
    ("openai", "https://api.openai.com/v1", "gpt-4o-mini", true),
    ("ollama", "http://localhost:11434/v1", "llama3.1", false),
    ("deepseek", "https://api.deepseek.com/v1", "deepseek-chat", true),
    ("qwen", "https://dashscope.aliyuncs.com/compatible-mode/v1", "qwen-plus", true),
    ("zhipu", "https://open.bigmodel.cn/api/paas/v4", "glm-4-flash", true),
];

const OPENAI_BASE: &str = "https://api.openai.com/v1";
/// `/audio/speech` with `response_format: pcm` answers 24 kHz mono PCM16.
const OPENAI_TTS_RATE: u32 = 24_000;

/// Register every cloud factory on `providers`.
pub fn register(providers: &Providers) {
    for &(name, endpoint, model, key_required) in LLM_VENDORS {
        providers.llm.register_factory(name, move |cfg| {
            let llm: Arc<dyn LanguageModel> = Arc::new(
                OpenAiCompatLlm::from_config(name, cfg, endpoint, model, key_required)?,
            );
            Ok(llm)
        });
    }
    providers.stt.register_factory("openai", |cfg| {
        let stt: Arc<dyn SpeechToText> =
            Arc::new(OpenAiSpeechToText::from_config(cfg)?);
        Ok(stt)
    });
    providers.tts.register_factory("openai", |cfg| {
        let tts: Arc<dyn TextToSpeech> =
            Arc::new(OpenAiTextToSpeech::from_config(cfg)?);
        Ok(tts)
    });
}

fn required_key(cfg: &ProviderConfig, vendor: &str) -> Result<String> {
    cfg.api_key
        .clone()
        .ok_or_else(|| VoxgateError::Provider(format!("{vendor}: api key not configured")))
}

fn base_url(cfg: &ProviderConfig, fallback: &str) -> String {
    cfg.endpoint
        .as_deref()
        .unwrap_or(fallback)
        .trim_end_matches('/')
        .to_string()
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(%status, "provider returned an error status");
    Err(VoxgateError::Provider(format!("HTTP {status}: {body}")))
}

// ── LLM ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[serde_json::Value]>::is_empty")]
    tools: &'a [serde_json::Value],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

/// Incremental parser for a chat-completion event stream.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
    calls: BTreeMap<usize, ToolCall>,
    done: bool,
}

impl SseDecoder {
    /// Consume raw body bytes; lines may span calls.
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ChatDelta>> {
        self.buf.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.line(&String::from_utf8_lossy(&line), &mut deltas)?;
        }
        Ok(deltas)
    }

    /// End of body: the last unterminated line, then the assembled tool calls.
    fn finish(&mut self) -> Result<Vec<ChatDelta>> {
        let rest = std::mem::take(&mut self.buf);
        let mut deltas = Vec::new();
        self.line(&String::from_utf8_lossy(&rest), &mut deltas)?;

        let calls: Vec<ToolCall> = std::mem::take(&mut self.calls)
            .into_values()
            .filter(|call| !call.function.name.is_empty())
            .collect();
        if !calls.is_empty() {
            deltas.push(ChatDelta::ToolCalls(calls));
        }
        Ok(deltas)
    }

    fn line(&mut self, line: &str, deltas: &mut Vec<ChatDelta>) -> Result<()> {
        let Some(data) = line.trim().strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim_start();
        if self.done || data.is_empty() {
            return Ok(());
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(data)?;
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                deltas.push(ChatDelta::Text(text));
            }
            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                let call = self
                    .calls
                    .entry(fragment.index)
                    .or_insert_with(|| ToolCall::function("", "", ""));
                if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        call.function.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        call.function.arguments.push_str(&arguments);
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct OpenAiCompatLlm {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl OpenAiCompatLlm {
    pub fn from_config(
        name: &str,
        cfg: &ProviderConfig,
        default_endpoint: &str,
        default_model: &str,
        key_required: bool,
    ) -> Result<Self> {
        let api_key = if key_required {
            Some(required_key(cfg, name)?)
        } else {
            cfg.api_key.clone()
        };
        Ok(Self {
            name: name.to_string(),
            base_url: base_url(cfg, default_endpoint),
            api_key,
            model: cfg.model.clone().unwrap_or_else(|| default_model.to_string()),
            http: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], tools: &[serde_json::Value]) -> Result<ChatReply> {
        let response = self.send(messages, tools, false).await?;
        let parsed: ChatResponse = response.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| VoxgateError::Provider("chat response had no choices".into()))?;

        Ok(ChatReply {
            content: message.content,
            tool_calls: message.tool_calls.unwrap_or_default(),
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<ChatStream> {
        let body = self.send(messages, tools, true).await?.bytes_stream().boxed();

        let deltas = stream::unfold(Some((body, SseDecoder::default())), |state| async move {
            let (mut body, mut decoder) = state?;
            let (batch, next) = match body.next().await {
                Some(Ok(bytes)) => match decoder.feed(&bytes) {
                    Ok(mut deltas) if decoder.done => match decoder.finish() {
                        Ok(tail) => {
                            deltas.extend(tail);
                            (deltas.into_iter().map(Ok).collect(), None)
                        }
                        Err(e) => (vec![Err(e)], None),
                    },
                    Ok(deltas) => (deltas.into_iter().map(Ok).collect(), Some((body, decoder))),
                    Err(e) => (vec![Err(e)], None),
                },
                Some(Err(e)) => (vec![Err(VoxgateError::from(e))], None),
                None => match decoder.finish() {
                    Ok(tail) => (tail.into_iter().map(Ok).collect::<Vec<_>>(), None),
                    Err(e) => (vec![Err(e)], None),
                },
            };
            Some((batch, next))
        })
        .flat_map(stream::iter)
        .boxed();
        Ok(deltas)
    }
}

impl OpenAiCompatLlm {
    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            provider = %self.name,
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            stream,
            "sending chat completion request"
        );

        let mut req = self.http.post(&url).json(&ChatRequest {
            model: &self.model,
            messages,
            tools,
            stream,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        error_for_status(req.send().await?).await
    }
}

// ── STT ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct OpenAiSpeechToText {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiSpeechToText {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            base_url: base_url(cfg, OPENAI_BASE),
            api_key: required_key(cfg, "openai stt")?,
            model: cfg.model.clone().unwrap_or_else(|| "whisper-1".into()),
            http: reqwest::Client::new(),
        })
    }
}

/// Wrap PCM16 mono in a WAV container in memory.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoxgateError::Audio(e.to_string()))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| VoxgateError::Audio(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| VoxgateError::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl SpeechToText for OpenAiSpeechToText {
    fn name(&self) -> &str {
        "openai"
    }

    async fn recognize(&self, pcm: &[u8]) -> Result<String> {
        let wav = pcm16_to_wav(pcm, INPUT_SAMPLE_RATE)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let parsed: TranscriptionResponse = error_for_status(response).await?.json().await?;
        Ok(parsed.text.trim().to_string())
    }
}

// ── TTS ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

pub struct OpenAiTextToSpeech {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    http: reqwest::Client,
}

impl OpenAiTextToSpeech {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            base_url: base_url(cfg, OPENAI_BASE),
            api_key: required_key(cfg, "openai tts")?,
            model: cfg.model.clone().unwrap_or_else(|| "tts-1".into()),
            voice: cfg.voice.clone().unwrap_or_else(|| "alloy".into()),
            http: reqwest::Client::new(),
        })
    }

    async fn request(&self, text: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice: &self.voice,
                response_format: "pcm",
            })
            .send()
            .await?;
        error_for_status(response).await
    }
}

#[async_trait]
impl TextToSpeech for OpenAiTextToSpeech {
    fn name(&self) -> &str {
        "openai"
    }

    fn sample_rate(&self) -> u32 {
        OPENAI_TTS_RATE
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        Ok(self.request(text).await?.bytes().await?.to_vec())
    }

    async fn synthesize_stream(&self, text: &str) -> Result<SpeechStream> {
        let response = self.request(text).await?;
        let stream: BoxStream<'static, Result<Vec<u8>>> = response
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(VoxgateError::from)
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_wrapper_has_header_and_samples() {
        let wav = pcm16_to_wav(&[0x01, 0x00, 0xFF, 0x7F], 16_000).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 4);
    }

    #[test]
    fn keyless_vendor_builds_without_key() {
        let cfg = ProviderConfig::new("ollama");
        let llm = OpenAiCompatLlm::from_config("ollama", &cfg, "http://localhost:11434/v1/", "llama3.1", false)
            .unwrap();
        assert_eq!(llm.base_url, "http://localhost:11434/v1");
        assert_eq!(llm.model(), "llama3.1");
    }

    #[test]
    fn keyed_vendor_requires_key() {
        let cfg = ProviderConfig::new("openai");
        assert!(OpenAiCompatLlm::from_config("openai", &cfg, OPENAI_BASE, "gpt-4o-mini", true).is_err());
        assert!(OpenAiSpeechToText::from_config(&cfg).is_err());
    }

    fn event(json: serde_json::Value) -> String {
        format!("data: {json}\n\n")
    }

    #[test]
    fn sse_text_deltas_survive_split_lines() {
        let body = [
            event(serde_json::json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]})),
            event(serde_json::json!({"choices": [{"delta": {"content": "Hel"}}]})),
            event(serde_json::json!({"choices": [{"delta": {"content": "lo."}}]})),
            "data: [DONE]\n\n".to_string(),
        ]
        .concat();
        let bytes = body.as_bytes();

        let mut decoder = SseDecoder::default();
        let mut deltas = Vec::new();
        for piece in bytes.chunks(7) {
            deltas.extend(decoder.feed(piece).unwrap());
        }
        deltas.extend(decoder.finish().unwrap());

        assert_eq!(
            deltas,
            [ChatDelta::Text("Hel".into()), ChatDelta::Text("lo.".into())]
        );
        assert!(decoder.done);
    }

    #[test]
    fn sse_tool_call_fragments_are_assembled_by_index() {
        let body = [
            event(serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "type": "function", "function": {"name": "get_time", "arguments": ""}}
            ]}}]})),
            event(serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 1, "id": "call_b", "function": {"name": "set_volume", "arguments": "{\"lev"}}
            ]}}]})),
            event(serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 1, "function": {"arguments": "el\":3}"}}
            ]}}]})),
            event(serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{}"}}
            ]}}]})),
        ]
        .concat();

        let mut decoder = SseDecoder::default();
        let mut deltas = decoder.feed(body.as_bytes()).unwrap();
        assert!(deltas.is_empty());
        deltas.extend(decoder.finish().unwrap());

        let [ChatDelta::ToolCalls(calls)] = deltas.as_slice() else {
            panic!("expected one tool-call delta, got {deltas:?}");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(calls[1].function.name, "set_volume");
        assert_eq!(calls[1].function.arguments, r#"{"level":3}"#);
    }

    #[test]
    fn sse_ignores_comments_and_data_after_done() {
        let body = ": keep-alive\n\ndata: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n";
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(body.as_bytes()).unwrap().is_empty());
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn sse_malformed_event_is_an_error() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: {not json}\n").is_err());
    }
}
