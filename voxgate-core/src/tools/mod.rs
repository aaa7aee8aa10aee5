//! Function-calling tools exposed to the language model.
//!
//! ## Dispatch
//!
//! ```text
//! LLM tool call (name, JSON args)
//!     └─► registry lookup ── absent ──► NotFound
//!         └─► parse args ── invalid ──► Error
//!             └─► callable(ctx, args) ── Err / panic ──► Error
//!                 └─► ToolOutcome { action: None | Response | ReqLlm | Error }
//! ```
//!
//! `ToolType` describes what a tool touches; only `ActionType` decides what
//! the dialogue does next.

pub mod builtin;
pub mod iot;

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::conversation::ConversationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolType {
    None,
    Wait,
    ChangeSysPrompt,
    SystemCtl,
    IotCtl,
    McpClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Error,
    #[serde(rename = "NOTFOUND")]
    NotFound,
    None,
    /// Speak `response` directly.
    Response,
    /// Feed `result` back to the LLM for another round.
    #[serde(rename = "REQLLM")]
    ReqLlm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tool_type: ToolType,
    pub action: ActionType,
    /// Raw tool output, e.g. `"60"`.
    pub result: String,
    /// User-facing sentence, e.g. `"volume set to 60"`.
    pub response: String,
}

impl ToolOutcome {
    pub fn response(tool_type: ToolType, result: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            tool_type,
            action: ActionType::Response,
            result: result.into(),
            response: response.into(),
        }
    }

    pub fn reqllm(tool_type: ToolType, result: impl Into<String>) -> Self {
        Self {
            tool_type,
            action: ActionType::ReqLlm,
            result: result.into(),
            response: String::new(),
        }
    }

    pub fn none(tool_type: ToolType, result: impl Into<String>) -> Self {
        Self {
            tool_type,
            action: ActionType::None,
            result: result.into(),
            response: String::new(),
        }
    }

    pub fn error(tool_type: ToolType, result: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            tool_type,
            action: ActionType::Error,
            result: result.into(),
            response: response.into(),
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self {
            tool_type: ToolType::None,
            action: ActionType::NotFound,
            result: format!("no tool named '{name}'"),
            response: String::new(),
        }
    }
}

/// One named parameter. `kind` is a JSON-schema primitive type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

impl PropertySchema {
    pub fn string(description: impl Into<String>) -> Self {
        Self::typed("string", description)
    }

    pub fn typed(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            kind: "object".into(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema, required: bool) -> Self {
        let name = name.into();
        if required && !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }
}

pub type ToolFn =
    Arc<dyn Fn(&mut ConversationContext, &Map<String, Value>) -> anyhow::Result<ToolOutcome> + Send + Sync>;

pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub tool_type: ToolType,
    pub parameters: ParameterSchema,
    callable: ToolFn,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("tool_type", &self.tool_type)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        tool_type: ToolType,
        parameters: ParameterSchema,
        callable: F,
    ) -> Self
    where
        F: Fn(&mut ConversationContext, &Map<String, Value>) -> anyhow::Result<ToolOutcome>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            tool_type,
            parameters,
            callable: Arc::new(callable),
        }
    }

    /// `{type:"function", function:{name, description, parameters}}`.
    pub fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    /// Parse the model's argument string and run the callable. Never panics
    /// and never returns `Err`: every failure becomes an `Error` outcome.
    pub fn invoke(&self, ctx: &mut ConversationContext, arguments: &str) -> ToolOutcome {
        let args = match parse_arguments(arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %self.name, "unparseable tool arguments: {e}");
                return ToolOutcome::error(self.tool_type, format!("invalid arguments: {e}"), "");
            }
        };

        match catch_unwind(AssertUnwindSafe(|| (self.callable)(ctx, &args))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(tool = %self.name, "tool failed: {e:#}");
                ToolOutcome::error(self.tool_type, e.to_string(), "")
            }
            Err(_) => {
                error!(tool = %self.name, "tool panicked");
                ToolOutcome::error(self.tool_type, "tool panicked", "")
            }
        }
    }
}

/// Empty or whitespace-only strings count as `{}`; anything else must be an
/// object.
fn parse_arguments(arguments: &str) -> serde_json::Result<Map<String, Value>> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(arguments)
}

/// Non-blank string argument, trimmed.
pub(crate) fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{key}'"))
}

/// Name → tool table. Descriptors are immutable and shared by `Arc`, so a
/// session's registry can start as a cheap filtered copy of the global one.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the process-wide built-in tools.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Returns the tool previously registered under the same name.
    pub fn register(&mut self, tool: ToolDescriptor) -> Option<Arc<ToolDescriptor>> {
        debug!(tool = %tool.name, "tool registered");
        self.tools.insert(tool.name.clone(), Arc::new(tool))
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let removed = self.tools.remove(name).is_some();
        if removed {
            info!(tool = %name, "tool unregistered");
        } else {
            warn!(tool = %name, "unregister of unknown tool");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool schemas for the chat request, in name order.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Copy restricted to `names`; an empty list keeps every tool. Unknown
    /// names are logged and skipped.
    pub fn filtered(&self, names: &[String]) -> ToolRegistry {
        if names.is_empty() {
            return self.clone();
        }
        let mut tools = BTreeMap::new();
        for name in names {
            match self.tools.get(name.trim()) {
                Some(tool) => {
                    tools.insert(tool.name.clone(), Arc::clone(tool));
                }
                None => warn!(tool = %name, "allowed tool is not registered"),
            }
        }
        ToolRegistry { tools }
    }

    pub fn dispatch(&self, ctx: &mut ConversationContext, name: &str, arguments: &str) -> ToolOutcome {
        dispatch(self.get(name), ctx, name, arguments)
    }
}

/// Run an already resolved tool. Split from the registry so a caller that
/// owns the registry through `ctx` can look up first and then lend `ctx`.
pub fn dispatch(
    tool: Option<Arc<ToolDescriptor>>,
    ctx: &mut ConversationContext,
    name: &str,
    arguments: &str,
) -> ToolOutcome {
    let Some(tool) = tool else {
        warn!(tool = %name, session_id = %ctx.session_id(), "tool not found");
        return ToolOutcome::not_found(name);
    };
    let outcome = tool.invoke(ctx, arguments);
    info!(
        tool = %name,
        session_id = %ctx.session_id(),
        action = ?outcome.action,
        "tool dispatched"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConnectionHandle;

    fn ctx() -> ConversationContext {
        let (connection, _rx) = ConnectionHandle::detached("t-1");
        ConversationContext::new("You are helpful.", 10, connection, ToolRegistry::new())
    }

    fn echo_tool() -> ToolDescriptor {
        ToolDescriptor::new(
            "echo",
            "Repeat a word",
            ToolType::None,
            ParameterSchema::new().property("word", PropertySchema::string("word to echo"), true),
            |_ctx, args| {
                let word = args
                    .get("word")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("missing word"))?;
                Ok(ToolOutcome::response(ToolType::None, word, format!("you said {word}")))
            },
        )
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = ToolRegistry::new();
        let outcome = registry.dispatch(&mut ctx(), "launch_rocket", "{}");
        assert_eq!(outcome.action, ActionType::NotFound);
    }

    #[test]
    fn callable_error_becomes_error_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        let outcome = registry.dispatch(&mut ctx(), "echo", "{}");
        assert_eq!(outcome.action, ActionType::Error);
        assert!(outcome.result.contains("missing word"));
    }

    #[test]
    fn panicking_callable_becomes_error_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDescriptor::new(
            "boom",
            "always panics",
            ToolType::None,
            ParameterSchema::new(),
            |_ctx, _args| panic!("kaboom"),
        ));
        let outcome = registry.dispatch(&mut ctx(), "boom", "");
        assert_eq!(outcome.action, ActionType::Error);
    }

    #[test]
    fn malformed_arguments_become_error_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        let outcome = registry.dispatch(&mut ctx(), "echo", "{not json");
        assert_eq!(outcome.action, ActionType::Error);
    }

    #[test]
    fn successful_call_passes_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        let outcome = registry.dispatch(&mut ctx(), "echo", r#"{"word":"hi"}"#);
        assert_eq!(outcome.action, ActionType::Response);
        assert_eq!(outcome.response, "you said hi");
    }

    #[test]
    fn schema_export_shape() {
        let schema = echo_tool().schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "echo");
        let params = &schema["function"]["parameters"];
        assert_eq!(params["type"], "object");
        assert_eq!(params["properties"]["word"]["type"], "string");
        assert_eq!(params["required"], json!(["word"]));
    }

    #[test]
    fn filtered_keeps_only_named_tools() {
        let registry = ToolRegistry::with_builtin();
        let only = registry.filtered(&["get_time".to_string(), "missing".to_string()]);
        assert_eq!(only.names(), vec!["get_time".to_string()]);
        assert_eq!(registry.filtered(&[]).len(), registry.len());
    }

    #[test]
    fn unregister_reports_presence() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.is_empty());
    }

    #[test]
    fn action_type_wire_names() {
        assert_eq!(serde_json::to_value(ActionType::ReqLlm).unwrap(), "REQLLM");
        assert_eq!(serde_json::to_value(ActionType::NotFound).unwrap(), "NOTFOUND");
        assert_eq!(serde_json::to_value(ToolType::ChangeSysPrompt).unwrap(), "CHANGE_SYS_PROMPT");
    }
}
