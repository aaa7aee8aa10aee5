//! Process-wide tools available to every session.

use chrono::Local;

use super::{
    required_str, ParameterSchema, PropertySchema, ToolDescriptor, ToolOutcome, ToolRegistry,
    ToolType,
};
use crate::conversation::ConversationContext;

pub const EXIT_TOOL: &str = "handle_exit_intent";
pub const CHANGE_ROLE_TOOL: &str = "change_role";
pub const TIME_TOOL: &str = "get_time";

pub fn register(registry: &mut ToolRegistry) {
    registry.register(exit_intent());
    registry.register(change_role());
    registry.register(current_time());
}

/// Ends the conversation once the goodbye has been spoken.
pub fn exit_intent() -> ToolDescriptor {
    ToolDescriptor::new(
        EXIT_TOOL,
        "Call when the user wants to end the conversation or leave.",
        ToolType::SystemCtl,
        ParameterSchema::new().property(
            "say_goodbye",
            PropertySchema::string("A friendly farewell to end the conversation with"),
            true,
        ),
        |ctx: &mut ConversationContext, args| {
            let goodbye = required_str(args, "say_goodbye")?;
            ctx.connection().set_close_after_reply(true);
            Ok(ToolOutcome::response(ToolType::SystemCtl, "exit intent handled", goodbye))
        },
    )
}

/// Swap the persona: new system prompt, empty history, greet in the new role.
pub fn change_role() -> ToolDescriptor {
    ToolDescriptor::new(
        CHANGE_ROLE_TOOL,
        "Call when the user asks the assistant to take on a different role or persona.",
        ToolType::ChangeSysPrompt,
        ParameterSchema::new()
            .property(
                "role_prompt",
                PropertySchema::string("System prompt describing the new role"),
                true,
            )
            .property(
                "greeting",
                PropertySchema::string("What the assistant says first in the new role"),
                true,
            ),
        |ctx: &mut ConversationContext, args| {
            let prompt = required_str(args, "role_prompt")?;
            let greeting = required_str(args, "greeting")?;
            ctx.set_system_prompt(prompt);
            ctx.clear_history();
            Ok(ToolOutcome::response(ToolType::ChangeSysPrompt, "role changed", greeting))
        },
    )
}

pub fn current_time() -> ToolDescriptor {
    ToolDescriptor::new(
        TIME_TOOL,
        "Get the current local date and time.",
        ToolType::None,
        ParameterSchema::new(),
        |_ctx, _args| {
            let now = Local::now().format("%A, %Y-%m-%d %H:%M").to_string();
            Ok(ToolOutcome::reqllm(ToolType::None, now))
        },
    )
}
