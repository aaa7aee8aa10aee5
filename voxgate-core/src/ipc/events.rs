//! Outbound message types.
//!
//! ## Message kinds
//!
//! | `type` | Fields | Sent when |
//! |--------|--------|-----------|
//! | `listen` | `state: start\|stop` | VAD confirms speech onset / end |
//! | `stt` | `text` | an utterance was recognized |
//! | `llm` | `text` | the reply text is final |
//! | `tts` | `state: start\|sentence_start\|stop`, `text?` | reply playback framing |
//! | `iot` | `commands` | a device tool issued a command |
//! | `error` | `message` | a turn failed |
//!
//! Every JSON frame carries the `session_id` next to the tagged payload.

use serde::{Deserialize, Serialize};

/// One frame for the transport, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Json(ServerMessage),
    /// PCM16 LE mono at the dialogue output rate.
    Audio(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Listen {
        state: ListenState,
    },
    Stt {
        text: String,
    },
    Llm {
        text: String,
    },
    Tts {
        state: TtsState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Iot {
        commands: Vec<IotCommand>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn tts(state: TtsState) -> Self {
        ServerMessage::Tts { state, text: None }
    }

    pub fn sentence_start(text: impl Into<String>) -> Self {
        ServerMessage::Tts {
            state: TtsState::SentenceStart,
            text: Some(text.into()),
        }
    }

    /// Serialize with the session id alongside the tagged payload.
    pub fn to_json(&self, session_id: &str) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            session_id,
            message: self,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    session_id: &'a str,
    #[serde(flatten)]
    message: &'a ServerMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

/// A device command, executed client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IotCommand {
    pub name: String,
    pub method: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}
