//! One conversational turn: recognize, reason (with tools), speak.
//!
//! ```text
//! utterance ─► STT (streamed in 20 ms frames when supported) ─► stt{text}
//!                      └─► LLM(history, tool schemas)
//!                            ├─ text ───────────────────────────────► reply
//!                            └─ tool calls ─► dispatch each
//!                                   ├─ Response  → reply = response text
//!                                   ├─ ReqLlm    → tool result appended, LLM again
//!                                   ├─ None      → reply = the LLM's own text
//!                                   └─ Error / NotFound → apology
//! reply ─► llm{text} ─► split sentences ─► TTS per sentence ─► audio frames
//! ```
//!
//! A streaming language model is spoken while it generates: each sentence
//! goes to TTS as soon as the splitter closes it, and `llm{text}` follows
//! once the completion is finished. Frames for a streamed reply are
//! `tts start`, the sentences, `llm`, `tts stop`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::session::SessionDiagnostics;
use super::{Gateway, SessionOptions};
use crate::audio::{f32_to_pcm16, pcm16_to_f32, resample::RateConverter};
use crate::conversation::{ConnectionHandle, ConversationContext};
use crate::error::{Result, VoxgateError};
use crate::ipc::events::{OutboundFrame, ServerMessage, TtsState};
use crate::provider::{ChatDelta, ChatMessage, ChatReply, LanguageModel, TextToSpeech};
use crate::tools::ActionType;

/// Sentences shorter than this are not split at a comma-class mark.
const MIN_CLAUSE_CHARS: usize = 10;
const RESAMPLE_CHUNK: usize = 1024;
/// 20 ms of 16 kHz PCM16, the frame size fed to streaming recognizers.
const STT_FRAME_BYTES: usize = 640;

/// Shared, read-only inputs of a turn.
pub(crate) struct TurnEnv<'a> {
    pub gateway: &'a Arc<Gateway>,
    pub options: &'a SessionOptions,
    pub diagnostics: &'a SessionDiagnostics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    /// Nothing recognized, or nothing to say.
    Silent,
    Replied,
    /// An apology was substituted for the reply.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
enum Reply {
    /// `spoken` when the text already went to TTS while streaming.
    Text { text: String, spoken: bool },
    Failure { spoken: String, detail: String },
}

pub(crate) async fn run_turn(
    env: &TurnEnv<'_>,
    ctx: &mut ConversationContext,
    utterance: Vec<u8>,
) -> TurnOutcome {
    let mut speaker = Speaker::new(env, ctx.connection().clone());
    let reply = match converse(env, ctx, &mut speaker, &utterance).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("turn failed: {e}");
            Some(Reply::Failure {
                spoken: env.gateway.config().dialogue.apology_text.clone(),
                detail: e.to_string(),
            })
        }
    };

    let outcome = match reply {
        None => TurnOutcome::Silent,
        Some(Reply::Text { text, spoken }) => {
            ctx.push(ChatMessage::assistant(text.clone()));
            ctx.connection()
                .send_message(ServerMessage::Llm { text: text.clone() });
            if !spoken {
                speaker.say_text(&text).await;
            }
            TurnOutcome::Replied
        }
        Some(Reply::Failure { spoken, detail }) => {
            // Keep user and assistant turns alternating.
            if ctx.history().last().is_some_and(ChatMessage::is_user) {
                ctx.push(ChatMessage::assistant(spoken.clone()));
            }
            ctx.connection()
                .send_message(ServerMessage::Error { message: detail });
            if let Some(e) = speaker.error.take() {
                warn!("speech synthesis failed: {e}");
            }
            speaker.say_text(&spoken).await;
            TurnOutcome::Failed
        }
    };

    match speaker.finish() {
        Ok(()) => outcome,
        Err(e) if outcome == TurnOutcome::Replied => {
            warn!("speech synthesis failed: {e}");
            ctx.connection().send_message(ServerMessage::Error {
                message: e.to_string(),
            });
            TurnOutcome::Failed
        }
        Err(e) => {
            warn!("apology synthesis failed: {e}");
            outcome
        }
    }
}

/// STT and the LLM/tool loop. `Ok(None)` when there is nothing to answer.
async fn converse(
    env: &TurnEnv<'_>,
    ctx: &mut ConversationContext,
    speaker: &mut Speaker<'_>,
    utterance: &[u8],
) -> Result<Option<Reply>> {
    let dialogue = &env.gateway.config().dialogue;

    let stt = env
        .gateway
        .resolve(|p| &p.stt, env.options.stt.as_ref())
        .await?;
    let text = if stt.supports_streaming() {
        let frames: Vec<Vec<u8>> = utterance
            .chunks(STT_FRAME_BYTES)
            .map(<[u8]>::to_vec)
            .collect();
        stt.recognize_stream(stream::iter(frames).boxed()).await?
    } else {
        stt.recognize(utterance).await?
    };
    let text = text.trim();
    if text.is_empty() {
        debug!("empty transcript, no reply");
        return Ok(None);
    }
    info!(stt = stt.name(), chars = text.len(), "utterance recognized");
    ctx.connection()
        .send_message(ServerMessage::Stt { text: text.to_string() });
    ctx.push(ChatMessage::user(text));

    let llm = env
        .gateway
        .resolve(|p| &p.llm, env.options.llm.as_ref())
        .await?;
    let mut transcript = ctx.messages();
    let mut reqllm_rounds = 0u32;

    loop {
        SessionDiagnostics::bump(&env.diagnostics.llm_calls);
        let (answer, spoken) = if llm.supports_streaming() {
            speak_while_streaming(llm.as_ref(), &transcript, &ctx.tool_schemas(), speaker).await?
        } else {
            (llm.chat(&transcript, &ctx.tool_schemas()).await?, false)
        };
        if answer.tool_calls.is_empty() {
            return Ok(non_empty(answer.content, spoken));
        }

        transcript.push(ChatMessage::assistant_tool_calls(
            answer.content.clone(),
            answer.tool_calls.clone(),
        ));

        let mut direct = Vec::new();
        let mut needs_llm = false;
        for call in &answer.tool_calls {
            env.diagnostics.tool_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = ctx.dispatch_tool(&call.function.name, &call.function.arguments);
            match outcome.action {
                ActionType::Response => direct.push(outcome.response),
                ActionType::ReqLlm => {
                    transcript.push(ChatMessage::tool(call.id.clone(), outcome.result));
                    needs_llm = true;
                }
                ActionType::None => {
                    transcript.push(ChatMessage::tool(call.id.clone(), outcome.result));
                }
                ActionType::Error | ActionType::NotFound => {
                    let spoken = if outcome.response.is_empty() {
                        dialogue.apology_text.clone()
                    } else {
                        outcome.response
                    };
                    return Ok(Some(Reply::Failure {
                        spoken,
                        detail: format!("tool '{}' failed: {}", call.function.name, outcome.result),
                    }));
                }
            }
        }

        if !direct.is_empty() {
            return Ok(non_empty(direct.join(" "), false));
        }
        if !needs_llm {
            return Ok(non_empty(answer.content, spoken));
        }
        if reqllm_rounds >= dialogue.max_tool_rounds {
            return Ok(Some(Reply::Failure {
                spoken: dialogue.apology_text.clone(),
                detail: format!("tool rounds exceeded ({})", dialogue.max_tool_rounds),
            }));
        }
        reqllm_rounds += 1;
    }
}

/// Run one streamed completion, handing each finished sentence to TTS
/// before the next delta is read. Returns the assembled reply and whether
/// any of it was spoken.
async fn speak_while_streaming(
    llm: &dyn LanguageModel,
    transcript: &[ChatMessage],
    tools: &[serde_json::Value],
    speaker: &mut Speaker<'_>,
) -> Result<(ChatReply, bool)> {
    let mut deltas = llm.chat_stream(transcript, tools).await?;
    let mut reply = ChatReply::default();
    let mut splitter = SentenceSplitter::default();
    let mut spoken = false;

    while let Some(delta) = deltas.next().await {
        match delta? {
            ChatDelta::Text(text) => {
                reply.content.push_str(&text);
                for sentence in splitter.push(&text) {
                    speaker.say(&sentence).await;
                    spoken = true;
                }
            }
            ChatDelta::ToolCalls(calls) => reply.tool_calls.extend(calls),
        }
    }
    if let Some(rest) = splitter.finish() {
        speaker.say(&rest).await;
        spoken = true;
    }
    Ok((reply, spoken))
}

fn non_empty(text: String, spoken: bool) -> Option<Reply> {
    let text = text.trim();
    (!text.is_empty()).then(|| Reply::Text {
        text: text.to_string(),
        spoken,
    })
}

/// Sends one turn's speech: `tts start` before the first sentence, `tts stop`
/// at [`finish`](Self::finish). The first synthesis error stops further
/// sentences and is reported by `finish`.
struct Speaker<'a> {
    env: &'a TurnEnv<'a>,
    connection: ConnectionHandle,
    tts: Option<Arc<dyn TextToSpeech>>,
    started: bool,
    error: Option<VoxgateError>,
}

impl<'a> Speaker<'a> {
    fn new(env: &'a TurnEnv<'a>, connection: ConnectionHandle) -> Self {
        Self {
            env,
            connection,
            tts: None,
            started: false,
            error: None,
        }
    }

    async fn say_text(&mut self, text: &str) {
        for sentence in split_sentences(text) {
            self.say(&sentence).await;
        }
    }

    async fn say(&mut self, sentence: &str) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.try_say(sentence).await {
            self.error = Some(e);
        }
    }

    async fn try_say(&mut self, sentence: &str) -> Result<()> {
        let tts = match &self.tts {
            Some(tts) => Arc::clone(tts),
            None => {
                let tts = self
                    .env
                    .gateway
                    .resolve(|p| &p.tts, self.env.options.tts.as_ref())
                    .await?;
                self.tts = Some(Arc::clone(&tts));
                tts
            }
        };
        if !self.started {
            self.connection
                .send_message(ServerMessage::tts(TtsState::Start));
            self.started = true;
        }
        self.connection
            .send_message(ServerMessage::sentence_start(sentence));
        self.synthesize(tts.as_ref(), sentence).await?;
        SessionDiagnostics::bump(&self.env.diagnostics.sentences_spoken);
        Ok(())
    }

    async fn synthesize(&self, tts: &dyn TextToSpeech, sentence: &str) -> Result<()> {
        let out_rate = self.env.gateway.config().dialogue.output_sample_rate;
        let mut pcm = Reframer::new(tts.sample_rate(), out_rate)?;

        if tts.supports_streaming() {
            let mut audio = tts.synthesize_stream(sentence).await?;
            while let Some(chunk) = audio.next().await {
                self.emit(pcm.push(chunk?));
            }
        } else {
            let audio = tts.synthesize(sentence).await?;
            self.emit(pcm.push(audio));
        }
        self.emit(pcm.finish());
        Ok(())
    }

    fn emit(&self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }
        if self.connection.send(OutboundFrame::Audio(frame)) {
            SessionDiagnostics::bump(&self.env.diagnostics.audio_frames_out);
        }
    }

    fn finish(self) -> Result<()> {
        if self.started {
            self.connection
                .send_message(ServerMessage::tts(TtsState::Stop));
        }
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Provider PCM to output-rate PCM. Holds back an odd trailing byte until
/// the next chunk completes the sample.
struct Reframer {
    converter: RateConverter,
    carry: Option<u8>,
}

impl Reframer {
    fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        Ok(Self {
            converter: RateConverter::new(source_rate, target_rate, RESAMPLE_CHUNK)?,
            carry: None,
        })
    }

    fn push(&mut self, mut bytes: Vec<u8>) -> Vec<u8> {
        if let Some(b) = self.carry.take() {
            bytes.insert(0, b);
        }
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }
        if self.converter.is_passthrough() {
            bytes
        } else {
            f32_to_pcm16(&self.converter.process(&pcm16_to_f32(&bytes)))
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        f32_to_pcm16(&self.converter.finish())
    }
}

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '。' | '!' | '！' | '?' | '？' | ';' | '；')
}

fn is_clause(c: char) -> bool {
    matches!(c, ',' | '，' | ':' | '：')
}

fn is_emoji(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F600..=0x1F64F
            | 0x1F300..=0x1F5FF
            | 0x1F680..=0x1F6FF
            | 0x1F900..=0x1F9FF
            | 0x1FA70..=0x1FAFF
            | 0x2600..=0x26FF
            | 0x2700..=0x27BF
            | 0x1F1E6..=0x1F1FF
            | 0x1F700..=0x1F77F
    )
}

/// Variation selector and zero-width joiner inside emoji sequences.
fn is_emoji_modifier(c: char) -> bool {
    matches!(c, '\u{FE0F}' | '\u{200D}')
}

/// Cuts streamed text into speakable sentences as it arrives.
///
/// Terminal marks and newlines always end a sentence, except a `.` between
/// digits. Comma-class marks and emoji end one only after
/// `MIN_CLAUSE_CHARS` characters. Emoji are never spoken.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    current: String,
    prev: Option<char>,
    /// A `.` after a digit; a boundary unless the next char is a digit.
    pending_dot: bool,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next piece of text; returns the sentences it completed.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        for c in text.chars() {
            if self.pending_dot {
                self.pending_dot = false;
                if !c.is_ascii_digit() {
                    sentences.extend(self.flush());
                }
            }

            if is_emoji(c) || is_emoji_modifier(c) {
                if is_emoji(c) && self.spoken_chars() >= MIN_CLAUSE_CHARS {
                    sentences.extend(self.flush());
                }
                self.prev = Some(c);
                continue;
            }
            if c.is_whitespace() && c != '\n' && self.current.ends_with(char::is_whitespace) {
                continue;
            }

            self.current.push(c);
            let boundary = if c == '\n' {
                true
            } else if c == '.' && self.prev.is_some_and(|p| p.is_ascii_digit()) {
                self.pending_dot = true;
                false
            } else {
                is_terminal(c) || (is_clause(c) && self.spoken_chars() >= MIN_CLAUSE_CHARS)
            };
            self.prev = Some(c);
            if boundary {
                sentences.extend(self.flush());
            }
        }
        sentences
    }

    /// End of text: whatever is left, if it has anything to say.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_dot = false;
        self.prev = None;
        self.flush()
    }

    fn spoken_chars(&self) -> usize {
        self.current.trim().chars().count()
    }

    fn flush(&mut self) -> Option<String> {
        let trimmed = self.current.trim();
        let sentence = trimmed
            .chars()
            .any(char::is_alphanumeric)
            .then(|| trimmed.to_string());
        self.current.clear();
        sentence
    }
}

/// Split a complete reply into speakable sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut splitter = SentenceSplitter::new();
    let mut sentences = splitter.push(text);
    sentences.extend(splitter.finish());
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hello there. How are you? Fine!"),
            ["Hello there.", "How are you?", "Fine!"]
        );
    }

    #[test]
    fn short_clauses_stay_joined() {
        assert_eq!(split_sentences("Yes, sure."), ["Yes, sure."]);
        assert_eq!(
            split_sentences("The weather today is sunny, with a light breeze."),
            ["The weather today is sunny,", "with a light breeze."]
        );
    }

    #[test]
    fn decimals_are_not_boundaries() {
        assert_eq!(
            split_sentences("It is 3.5 degrees outside."),
            ["It is 3.5 degrees outside."]
        );
        assert_eq!(
            split_sentences("It costs 12. Anything else?"),
            ["It costs 12.", "Anything else?"]
        );
    }

    #[test]
    fn full_width_marks_split() {
        assert_eq!(split_sentences("你好。今天天气很好！"), ["你好。", "今天天气很好！"]);
    }

    #[test]
    fn trailing_text_without_punctuation_is_kept() {
        assert_eq!(split_sentences("Done. and then"), ["Done.", "and then"]);
    }

    #[test]
    fn punctuation_only_fragments_are_dropped() {
        assert_eq!(split_sentences("Okay... ?!"), ["Okay."]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn newlines_end_sentences() {
        assert_eq!(
            split_sentences("First item\nSecond item\n\nThird"),
            ["First item", "Second item", "Third"]
        );
    }

    #[test]
    fn emoji_are_dropped_and_split_long_clauses() {
        assert_eq!(
            split_sentences("That sounds wonderful 😊 Let me know how it goes"),
            ["That sounds wonderful", "Let me know how it goes"]
        );
        assert_eq!(split_sentences("Hi 👋 there."), ["Hi there."]);
        assert_eq!(split_sentences("Sunny today ☀\u{FE0F}"), ["Sunny today"]);
        assert!(split_sentences("🎉🎉").is_empty());
    }

    #[test]
    fn streamed_pieces_split_like_whole_text() {
        let text = "The weather today is sunny, with 3.5 mm of rain. Bring an umbrella!";
        let whole = split_sentences(text);

        for size in [1, 2, 5, 13] {
            let chars: Vec<char> = text.chars().collect();
            let mut splitter = SentenceSplitter::new();
            let mut pieces = Vec::new();
            for chunk in chars.chunks(size) {
                pieces.extend(splitter.push(&chunk.iter().collect::<String>()));
            }
            pieces.extend(splitter.finish());
            assert_eq!(pieces, whole, "chunk size {size}");
        }
    }

    #[test]
    fn decimal_point_waits_for_the_next_piece() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Pi is about 3.").is_empty());
        assert!(splitter.push("14").is_empty());
        assert_eq!(splitter.push(". Neat"), ["Pi is about 3.14."]);
        assert_eq!(splitter.finish().as_deref(), Some("Neat"));
    }
}
