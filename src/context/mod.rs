//! Shared conversation state.
//!
//! One [`ConversationContext`] per session, referenced by the user
//! aggregator, the assistant aggregator and the LLM stage. All message
//! mutation goes through the single internal lock; frames carry the
//! context by `Arc` reference.
//!
//! A [`Message`] is flat: a role, text content, the tool invocations an
//! assistant turn requested, and — for tool-role messages — the call id
//! being answered. Tool replies start life as placeholders and are
//! rewritten in place when the call resolves, so the history is never
//! left half-written across an interruption.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Session-level instructions, always first in the history.
    System,
    /// The human on the call.
    User,
    /// The voice agent.
    Assistant,
    /// A tool answering an assistant's call.
    Tool,
}

/// One tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Identifier correlating the call with its reply.
    pub call_id: String,
    /// Function name.
    pub function_name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

/// One entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who authored this message.
    pub role: Role,
    /// Text content; for tool messages, the serialized result.
    pub content: String,
    /// Tool invocations requested in this turn (assistant turns only).
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// For tool-role messages, the call being answered.
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// A plain message with no tool-call bookkeeping.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Session instructions.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// A completed user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// A committed assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant turn that requests tool invocations.
    pub fn tool_request(calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// A tool-role reply correlated to a call id.
    pub fn tool_reply(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Whether this message is the tool reply for `call_id`.
    pub fn answers_call(&self, call_id: &str) -> bool {
        self.role == Role::Tool && self.tool_call_id.as_deref() == Some(call_id)
    }
}

/// A tool the LLM may call, in vendor-neutral JSON-schema form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Function name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Placeholder content for a tool message whose call is still running.
pub const TOOL_IN_PROGRESS: &str = "IN_PROGRESS";
/// Content written into a tool message whose call was cancelled.
pub const TOOL_CANCELLED: &str = "CANCELLED";

/// Conversation state shared across the pipeline.
///
/// The message list is the only mutable part and sits behind one mutex;
/// prompt, temperature and tool schema are fixed for the session.
#[derive(Debug)]
pub struct ConversationContext {
    messages: Mutex<Vec<Message>>,
    system_prompt: Option<String>,
    temperature: f32,
    tools: Vec<ToolDefinition>,
    tool_choice: Option<String>,
}

impl ConversationContext {
    /// Create a context with a system prompt and sampling temperature.
    pub fn new(system_prompt: Option<String>, temperature: f32) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            system_prompt,
            temperature,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    /// Build a context from the session's LLM configuration.
    pub fn from_config(config: &crate::config::LlmConfig) -> Self {
        Self::new(config.system_prompt.clone(), config.temperature)
    }

    /// Attach the tool schema list.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Attach a tool-choice directive (vendor-neutral string).
    pub fn with_tool_choice(mut self, choice: impl Into<String>) -> Self {
        self.tool_choice = Some(choice.into());
        self
    }

    /// The session system prompt.
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// The session sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// The tool schema list.
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// The tool-choice directive, if any.
    pub fn tool_choice(&self) -> Option<&str> {
        self.tool_choice.as_deref()
    }

    /// Snapshot of the message history, system message first.
    pub fn messages(&self) -> Vec<Message> {
        let messages = lock_unpoisoned(&self.messages);
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            out.push(Message::system(prompt.clone()));
        }
        out.extend(messages.iter().cloned());
        out
    }

    /// Number of messages, excluding the system prompt.
    pub fn message_count(&self) -> usize {
        lock_unpoisoned(&self.messages).len()
    }

    /// Append one message.
    pub fn push_message(&self, message: Message) {
        lock_unpoisoned(&self.messages).push(message);
    }

    /// Append several messages.
    pub fn append_messages(&self, new: Vec<Message>) {
        lock_unpoisoned(&self.messages).extend(new);
    }

    /// Replace the message history.
    pub fn set_messages(&self, new: Vec<Message>) {
        *lock_unpoisoned(&self.messages) = new;
    }

    /// Record a tool call as started: append the assistant message carrying
    /// the call plus an in-progress placeholder tool message.
    pub fn add_tool_call_in_progress(
        &self,
        call_id: &str,
        function_name: &str,
        arguments: &serde_json::Value,
    ) {
        let mut messages = lock_unpoisoned(&self.messages);
        messages.push(Message::tool_request(vec![ToolCallRecord {
            call_id: call_id.to_owned(),
            function_name: function_name.to_owned(),
            arguments: arguments.clone(),
        }]));
        messages.push(Message::tool_reply(call_id, TOOL_IN_PROGRESS));
    }

    /// Overwrite the tool message for `call_id` with real content.
    ///
    /// Returns false if no tool message with that id exists.
    pub fn resolve_tool_call(&self, call_id: &str, content: &str) -> bool {
        self.rewrite_tool_reply(call_id, content)
    }

    /// Mark the tool message for `call_id` as cancelled.
    pub fn cancel_tool_call(&self, call_id: &str) -> bool {
        self.rewrite_tool_reply(call_id, TOOL_CANCELLED)
    }

    fn rewrite_tool_reply(&self, call_id: &str, new_content: &str) -> bool {
        let mut messages = lock_unpoisoned(&self.messages);
        for message in messages.iter_mut().rev() {
            if message.answers_call(call_id) {
                message.content = new_content.to_owned();
                return true;
            }
        }
        false
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Check that every tool message correlates with a prior assistant
/// tool call.
///
/// # Errors
///
/// Returns a description of the first orphaned tool message found.
pub fn validate_message_sequence(messages: &[Message]) -> std::result::Result<(), String> {
    let mut known_call_ids: Vec<&str> = Vec::new();
    for (index, message) in messages.iter().enumerate() {
        for call in &message.tool_calls {
            known_call_ids.push(&call.call_id);
        }
        if message.role == Role::Tool {
            match &message.tool_call_id {
                None => {
                    return Err(format!("tool message at index {index} has no call id"));
                }
                Some(call_id) if !known_call_ids.iter().any(|id| id == call_id) => {
                    return Err(format!(
                        "tool message at index {index} references unknown call id {call_id}"
                    ));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    // ── messages ─────────────────────────────────────────────────────

    #[test]
    fn system_prompt_always_first() {
        let context = ConversationContext::new(Some("be brief".into()), 0.7);
        context.push_message(Message::user("hello"));
        context.push_message(Message::assistant("hi"));
        let messages = context.messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
    }

    #[test]
    fn no_system_prompt_no_system_message() {
        let context = ConversationContext::new(None, 0.7);
        context.push_message(Message::user("hello"));
        assert_eq!(context.messages().len(), 1);
    }

    #[test]
    fn replace_messages() {
        let context = ConversationContext::new(None, 0.7);
        context.push_message(Message::user("old"));
        context.set_messages(vec![Message::user("new")]);
        assert_eq!(context.messages()[0].content, "new");
    }

    // ── tool calls ──────────────────────────────────────────────────

    #[test]
    fn tool_call_lifecycle() {
        let context = ConversationContext::new(None, 0.7);
        context.add_tool_call_in_progress("t1", "lookup", &serde_json::json!({"q": "x"}));

        let messages = context.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].tool_calls[0].call_id, "t1");
        assert_eq!(messages[0].tool_calls[0].arguments["q"], "x");
        assert!(messages[1].answers_call("t1"));
        assert_eq!(messages[1].content, TOOL_IN_PROGRESS);

        assert!(context.resolve_tool_call("t1", "{\"answer\":42}"));
        let messages = context.messages();
        assert_eq!(messages[1].content, "{\"answer\":42}");
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("t1"));

        validate_message_sequence(&messages).unwrap();
    }

    #[test]
    fn resolve_unknown_call_is_false() {
        let context = ConversationContext::new(None, 0.7);
        assert!(!context.resolve_tool_call("nope", "{}"));
    }

    #[test]
    fn cancel_rewrites_placeholder() {
        let context = ConversationContext::new(None, 0.7);
        context.add_tool_call_in_progress("t1", "lookup", &serde_json::json!({}));
        assert!(context.cancel_tool_call("t1"));
        let messages = context.messages();
        assert_eq!(messages[1].content, TOOL_CANCELLED);
    }

    #[test]
    fn orphan_tool_message_fails_validation() {
        let orphan = vec![Message::tool_reply("ghost", "{}")];
        assert!(validate_message_sequence(&orphan).is_err());

        let missing_id = vec![Message {
            role: Role::Tool,
            content: "{}".into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }];
        assert!(validate_message_sequence(&missing_id).is_err());
    }

    #[test]
    fn non_tool_messages_do_not_need_call_ids() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        validate_message_sequence(&messages).unwrap();
    }
}
