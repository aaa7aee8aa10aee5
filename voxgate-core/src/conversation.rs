//! Per-session conversation state shared with tool callables.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ipc::events::{IotCommand, OutboundFrame, ServerMessage};
use crate::provider::ChatMessage;
use crate::tools::iot::{IotDescriptor, IotDevices, IotStateUpdate};
use crate::tools::{self, ToolOutcome, ToolRegistry};

/// Cloneable reference to the live client connection.
///
/// Sends are fire-and-forget: once the session is cancelled or the host
/// dropped the receiver, frames are discarded and `send` returns `false`.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Connection>,
}

struct Connection {
    session_id: String,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
    close_after_reply: AtomicBool,
    devices: RwLock<IotDevices>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("session_id", &self.inner.session_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(
        session_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Connection {
                session_id: session_id.into(),
                outbound,
                cancel,
                close_after_reply: AtomicBool::new(false),
                devices: RwLock::new(IotDevices::default()),
            }),
        }
    }

    /// A handle with its own channel and token, for use outside a gateway.
    pub fn detached(session_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(session_id, tx, CancellationToken::new()), rx)
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_open(&self) -> bool {
        !self.inner.cancel.is_cancelled() && !self.inner.outbound.is_closed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn send(&self, frame: OutboundFrame) -> bool {
        if !self.is_open() {
            return false;
        }
        self.inner.outbound.send(frame).is_ok()
    }

    pub fn send_message(&self, message: ServerMessage) -> bool {
        self.send(OutboundFrame::Json(message))
    }

    pub fn set_close_after_reply(&self, close: bool) {
        self.inner.close_after_reply.store(close, Ordering::SeqCst);
    }

    pub fn close_after_reply(&self) -> bool {
        self.inner.close_after_reply.load(Ordering::SeqCst)
    }

    pub fn register_device(&self, descriptor: IotDescriptor) {
        self.inner.devices.write().register(descriptor);
    }

    /// Returns how many property values were accepted.
    pub fn update_iot_state(&self, updates: &[IotStateUpdate]) -> usize {
        let mut devices = self.inner.devices.write();
        updates.iter().map(|u| devices.apply(u)).sum()
    }

    pub fn iot_value(&self, device: &str, property: &str) -> Option<Value> {
        self.inner.devices.read().value(device, property)
    }

    /// Send a device command. `false` when the device does not declare the
    /// method or the connection is gone.
    pub fn send_iot_command(&self, device: &str, method: &str, parameters: Map<String, Value>) -> bool {
        if !self.inner.devices.read().has_method(device, method) {
            warn!(session_id = %self.session_id(), %device, %method, "iot method not declared");
            return false;
        }
        debug!(session_id = %self.session_id(), %device, %method, "sending iot command");
        self.send_message(ServerMessage::Iot {
            commands: vec![IotCommand {
                name: device.to_string(),
                method: method.to_string(),
                parameters,
            }],
        })
    }
}

/// History, active system prompt, session tools and the connection.
///
/// History holds only user and final assistant messages; tool-call rounds
/// live in the turn's scratch transcript and are not retained.
#[derive(Debug)]
pub struct ConversationContext {
    system_prompt: String,
    history: Vec<ChatMessage>,
    max_history: usize,
    connection: ConnectionHandle,
    tools: ToolRegistry,
}

impl ConversationContext {
    pub fn new(
        system_prompt: impl Into<String>,
        max_history: usize,
        connection: ConnectionHandle,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            max_history: max_history.max(2),
            connection,
            tools,
        }
    }

    pub fn session_id(&self) -> &str {
        self.connection.session_id()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Append and trim oldest-first so the history starts at a user message.
    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
        while self.history.len() > self.max_history {
            self.history.remove(0);
            while self.history.first().is_some_and(|m| !m.is_user()) {
                self.history.remove(0);
            }
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// System prompt followed by history, ready for a chat request.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    pub fn tool_schemas(&self) -> Vec<Value> {
        self.tools.schemas()
    }

    pub fn dispatch_tool(&mut self, name: &str, arguments: &str) -> ToolOutcome {
        let tool = self.tools.get(name);
        tools::dispatch(tool, self, name, arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(max: usize) -> ConversationContext {
        let (connection, _rx) = ConnectionHandle::detached("c-1");
        ConversationContext::new("Be brief.", max, connection, ToolRegistry::new())
    }

    #[test]
    fn history_trims_in_pairs_from_the_front() {
        let mut ctx = context(4);
        for i in 0..3 {
            ctx.push(ChatMessage::user(format!("q{i}")));
            ctx.push(ChatMessage::assistant(format!("a{i}")));
        }
        let contents: Vec<_> = ctx.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["q1", "a1", "q2", "a2"]);
    }

    #[test]
    fn messages_start_with_system_prompt() {
        let mut ctx = context(10);
        ctx.push(ChatMessage::user("hello"));
        let messages = ctx.messages();
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "Be brief.");
        assert_eq!(messages[1].content, "hello");
    }

    #[test]
    fn empty_prompt_is_omitted() {
        let mut ctx = context(10);
        ctx.set_system_prompt("");
        ctx.push(ChatMessage::user("hello"));
        assert_eq!(ctx.messages().len(), 1);
    }

    #[test]
    fn sends_are_dropped_after_cancellation() {
        let (connection, mut rx) = ConnectionHandle::detached("c-2");
        assert!(connection.send(OutboundFrame::Audio(vec![1, 2])));
        connection.cancellation().cancel();
        assert!(!connection.is_open());
        assert!(!connection.send(OutboundFrame::Audio(vec![3, 4])));
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Audio(vec![1, 2]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn undeclared_iot_method_is_refused() {
        let (connection, mut rx) = ConnectionHandle::detached("c-3");
        assert!(!connection.send_iot_command("Fan", "Spin", Map::new()));
        assert!(rx.try_recv().is_err());
    }
}
