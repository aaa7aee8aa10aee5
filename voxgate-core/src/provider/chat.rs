//! Chat message types in the OpenAI chat-completion shape.

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// `system`, `user`, `assistant` or `tool`.
    pub role: String,

    /// Vendors send `null` next to tool calls; read as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::assistant(content)
        }
    }

    /// Function-result message answering `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new("tool", content)
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,

    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,

    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,

    /// JSON-encoded argument object, as produced by the model.
    #[serde(default)]
    pub arguments: String,
}

/// What the language model answered: text, tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatDelta {
    /// Next piece of the reply text, in order.
    Text(String),
    /// Tool calls, each complete. Sent once the stream has assembled them.
    ToolCalls(Vec<ToolCall>),
}

impl ChatReply {
    /// Single-delta view of a finished reply.
    pub fn into_deltas(self) -> Vec<ChatDelta> {
        let mut deltas = Vec::with_capacity(2);
        if !self.content.is_empty() {
            deltas.push(ChatDelta::Text(self.content));
        }
        if !self.tool_calls.is_empty() {
            deltas.push(ChatDelta::ToolCalls(self.tool_calls));
        }
        deltas
    }
}

fn function_type() -> String {
    "function".into()
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_content_reads_as_empty() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"role":"assistant","content":null,"tool_calls":[{"id":"c1","type":"function","function":{"name":"get_time","arguments":"{}"}}]}"#,
        )
        .unwrap();
        assert_eq!(msg.content, "");
        assert_eq!(msg.tool_calls.unwrap()[0].function.name, "get_time");
    }

    #[test]
    fn tool_message_serializes_call_id() {
        let json = serde_json::to_value(ChatMessage::tool("call_1", "60")).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn finished_reply_splits_into_text_then_calls() {
        let reply = ChatReply {
            content: "Checking.".into(),
            tool_calls: vec![ToolCall::function("c1", "get_time", "{}")],
        };
        let deltas = reply.into_deltas();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0], ChatDelta::Text("Checking.".into()));
        assert!(matches!(&deltas[1], ChatDelta::ToolCalls(calls) if calls[0].id == "c1"));
        assert!(ChatReply::default().into_deltas().is_empty());
    }
}
