//! Cloud providers against a local mock server.
//!
//! Coverage:
//! - chat completion with text, with tool calls, with `null` content
//! - tool schemas forwarded only when present
//! - keyless vendor sends no Authorization header
//! - non-2xx and empty-choices failures
//! - streamed chat: text deltas in order, tool calls assembled at the end
//! - transcription upload and speech download (one-shot and streamed)
//! - registry resolution of a vendor by name with a custom endpoint

#![cfg(feature = "cloud")]

use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use voxgate_core::provider::openai::{OpenAiCompatLlm, OpenAiSpeechToText, OpenAiTextToSpeech};
use voxgate_core::{
    ChatDelta, ChatMessage, LanguageModel, ProviderConfig, ProviderDefaults, Providers, SpeechToText,
    TextToSpeech, VoxgateError,
};

fn keyed(server: &MockServer, provider: &str) -> ProviderConfig {
    ProviderConfig::new(provider)
        .with_endpoint(server.uri())
        .with_api_key("sk-mock-key")
}

fn openai_llm(server: &MockServer) -> OpenAiCompatLlm {
    OpenAiCompatLlm::from_config(
        "openai",
        &keyed(server, "openai"),
        "https://unused.invalid/v1",
        "test-model",
        true,
    )
    .expect("llm")
}

fn conversation() -> Vec<ChatMessage> {
    vec![ChatMessage::system("Be brief."), ChatMessage::user("Hello")]
}

// ── chat completions ───────────────────────────────────────────────────

#[tokio::test]
async fn chat_returns_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-mock-key"))
        .and(body_partial_json(json!({"model": "test-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi! How can I help?"},
                "finish_reason": "stop"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = openai_llm(&server)
        .chat(&conversation(), &[])
        .await
        .expect("chat");
    assert_eq!(reply.content, "Hi! How can I help?");
    assert!(reply.tool_calls.is_empty());
}

#[tokio::test]
async fn chat_returns_tool_calls_with_null_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_time", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tools = vec![json!({
        "type": "function",
        "function": {"name": "get_time", "description": "Current time", "parameters": {"type": "object", "properties": {}}}
    })];
    let reply = openai_llm(&server)
        .chat(&conversation(), &tools)
        .await
        .expect("chat");

    assert!(reply.content.is_empty());
    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].id, "call_abc");
    assert_eq!(reply.tool_calls[0].function.name, "get_time");
    assert_eq!(reply.tool_calls[0].function.arguments, "{}");

    let requests = server.received_requests().await.expect("recording on");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json body");
    assert_eq!(body["tools"][0]["function"]["name"], "get_time");
    assert_eq!(body["messages"][1]["role"], "user");
}

#[tokio::test]
async fn chat_omits_empty_tool_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(&server)
        .await;

    openai_llm(&server)
        .chat(&conversation(), &[])
        .await
        .expect("chat");

    let requests = server.received_requests().await.expect("recording on");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json body");
    assert!(body.get("tools").is_none());
    assert!(body.get("stream").is_none());
}

#[tokio::test]
async fn keyless_vendor_sends_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "local answer"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cfg = ProviderConfig::new("ollama").with_endpoint(format!("{}/", server.uri()));
    let llm = OpenAiCompatLlm::from_config("ollama", &cfg, "http://unused.invalid", "llama3.1", false)
        .expect("llm");
    let reply = llm.chat(&conversation(), &[]).await.expect("chat");
    assert_eq!(reply.content, "local answer");

    let requests = server.received_requests().await.expect("recording on");
    let has_auth = |r: &Request| r.headers.contains_key("authorization");
    assert!(!requests.iter().any(has_auth));
}

#[tokio::test]
async fn http_error_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let err = openai_llm(&server)
        .chat(&conversation(), &[])
        .await
        .expect_err("401 must fail");
    match err {
        VoxgateError::Provider(msg) => {
            assert!(msg.contains("401"), "{msg}");
            assert!(msg.contains("invalid api key"), "{msg}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn empty_choices_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let err = openai_llm(&server)
        .chat(&conversation(), &[])
        .await
        .expect_err("no choices");
    assert!(matches!(err, VoxgateError::Provider(_)));
}

// ── streamed chat ──────────────────────────────────────────────────────

fn sse(events: &[serde_json::Value]) -> String {
    let mut body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn streamed_chat_yields_text_deltas_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[
                    json!({"choices": [{"delta": {"role": "assistant"}}]}),
                    json!({"choices": [{"delta": {"content": "Hi! "}}]}),
                    json!({"choices": [{"delta": {"content": "How can I help?"}}]}),
                    json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let llm = openai_llm(&server);
    assert!(llm.supports_streaming());
    let deltas: Vec<ChatDelta> = llm
        .chat_stream(&conversation(), &[])
        .await
        .expect("stream")
        .map(|d| d.expect("delta"))
        .collect()
        .await;

    assert_eq!(
        deltas,
        [
            ChatDelta::Text("Hi! ".into()),
            ChatDelta::Text("How can I help?".into())
        ]
    );
}

#[tokio::test]
async fn streamed_chat_assembles_tool_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse(&[
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_t", "type": "function", "function": {"name": "get_time", "arguments": "{"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "}"}}
            ]}}]}),
        ])))
        .mount(&server)
        .await;

    let deltas: Vec<ChatDelta> = openai_llm(&server)
        .chat_stream(&conversation(), &[])
        .await
        .expect("stream")
        .map(|d| d.expect("delta"))
        .collect()
        .await;

    let [ChatDelta::ToolCalls(calls)] = deltas.as_slice() else {
        panic!("expected tool calls, got {deltas:?}");
    };
    assert_eq!(calls[0].id, "call_t");
    assert_eq!(calls[0].function.name, "get_time");
    assert_eq!(calls[0].function.arguments, "{}");
}

#[tokio::test]
async fn streamed_chat_error_status_fails_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let err = openai_llm(&server)
        .chat_stream(&conversation(), &[])
        .await
        .err()
        .expect("429 must fail");
    assert!(matches!(err, VoxgateError::Provider(ref msg) if msg.contains("429")));
}

// ── speech ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn transcription_uploads_wav_and_trims_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .and(header("Authorization", "Bearer sk-mock-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "  turn on the light \n"})))
        .expect(1)
        .mount(&server)
        .await;

    let stt = OpenAiSpeechToText::from_config(&keyed(&server, "openai")).expect("stt");
    let text = stt.recognize(&[0u8; 3_200]).await.expect("recognize");
    assert_eq!(text, "turn on the light");

    let requests = server.received_requests().await.expect("recording on");
    let body = &requests[0].body;
    let has = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
    assert!(has(b"RIFF"));
    assert!(has(b"whisper-1"));
}

#[tokio::test]
async fn speech_requests_pcm_and_returns_bytes() {
    let server = MockServer::start().await;
    let pcm = vec![7u8; 4_800];
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .and(body_partial_json(json!({
            "model": "tts-1",
            "voice": "nova",
            "input": "Hello there.",
            "response_format": "pcm"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(pcm.clone()))
        .expect(2)
        .mount(&server)
        .await;

    let mut cfg = keyed(&server, "openai");
    cfg.voice = Some("nova".into());
    let tts = OpenAiTextToSpeech::from_config(&cfg).expect("tts");
    assert_eq!(tts.sample_rate(), 24_000);
    assert!(tts.supports_streaming());

    let whole = tts.synthesize("Hello there.").await.expect("synthesize");
    assert_eq!(whole, pcm);

    let mut stream = tts.synthesize_stream("Hello there.").await.expect("stream");
    let mut streamed = Vec::new();
    while let Some(chunk) = stream.next().await {
        streamed.extend(chunk.expect("chunk"));
    }
    assert_eq!(streamed, pcm);
}

#[tokio::test]
async fn speech_error_surfaces_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let tts = OpenAiTextToSpeech::from_config(&keyed(&server, "openai")).expect("tts");
    assert!(tts.synthesize_stream("Hi.").await.is_err());
}

// ── registry ───────────────────────────────────────────────────────────

#[tokio::test]
async fn registry_builds_vendor_from_session_config() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "deepseek-chat"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "from deepseek"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let providers = Providers::new(&ProviderDefaults::default());
    voxgate_core::provider::openai::register(&providers);

    let cfg = keyed(&server, "DeepSeek").with_config_id(7);
    let llm = providers.llm.get_service(Some(&cfg)).expect("resolved");
    assert_eq!(llm.name(), "deepseek");
    assert_eq!(llm.model(), "deepseek-chat");

    let again = providers.llm.get_service(Some(&cfg)).expect("cached");
    assert!(std::sync::Arc::ptr_eq(&llm, &again));

    let reply = llm.chat(&conversation(), &[]).await.expect("chat");
    assert_eq!(reply.content, "from deepseek");

    // Missing key: construction fails and nothing is cached.
    let keyless = ProviderConfig::new("qwen").with_endpoint(server.uri());
    assert!(providers.llm.get_service(Some(&keyless)).is_err());
    assert_eq!(providers.llm.cached_len(), 1);
}
