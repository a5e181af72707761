//! Conversation history for one session.
//!
//! A `Dialogue` owns the ordered message list for a single connection. It is
//! bounded to the most recent N exchange rounds (a round starts at a user
//! message) and maintains exactly one system message, which is replaceable
//! but never duplicated.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role of a message within the dialogue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A fully assembled tool call recorded on an assistant message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// One message in the dialogue.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// An assistant message that carries tool calls instead of text.
    pub fn assistant_tool_calls(calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// A tool-result message answering the call with the given id.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Bounded conversation history with a single system message.
#[derive(Debug, Clone)]
pub struct Dialogue {
    system: String,
    messages: Vec<Message>,
    max_rounds: usize,
}

impl Dialogue {
    pub fn new(system_prompt: impl Into<String>, max_rounds: usize) -> Self {
        Self {
            system: system_prompt.into(),
            messages: Vec::new(),
            max_rounds: max_rounds.max(1),
        }
    }

    /// Replaces the system prompt. The system message is never duplicated.
    pub fn update_system(&mut self, prompt: impl Into<String>) {
        self.system = prompt.into();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system
    }

    pub fn set_max_rounds(&mut self, max_rounds: usize) {
        self.max_rounds = max_rounds.max(1);
        self.trim();
    }

    /// Appends a message and evicts the oldest exchange rounds beyond the
    /// configured bound.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.trim();
    }

    /// Non-system messages currently retained, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of exchange rounds (user messages) currently retained.
    pub fn rounds(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count()
    }

    /// The full message list for one model invocation: the system message
    /// first (with an optional memory summary appended), then the retained
    /// history.
    pub fn render_with_context(&self, memory: Option<&str>) -> Vec<Message> {
        let system = match memory {
            Some(summary) if !summary.is_empty() => Message::system(format!(
                "{}\n\nRelevant memory from earlier conversations:\n{}",
                self.system, summary
            )),
            _ => Message::system(self.system.clone()),
        };
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(system);
        out.extend(self.messages.iter().cloned());
        out
    }

    fn trim(&mut self) {
        while self.rounds() > self.max_rounds {
            // Drop the oldest round: the first user message and everything
            // up to (but excluding) the next user message.
            let Some(first_user) = self.messages.iter().position(|m| m.role == Role::User) else {
                break;
            };
            self.messages.drain(..=first_user);
            while self
                .messages
                .first()
                .is_some_and(|m| m.role != Role::User)
            {
                self.messages.remove(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(dialogue: &mut Dialogue, n: usize) {
        dialogue.push(Message::user(format!("question {n}")));
        dialogue.push(Message::assistant(format!("answer {n}")));
    }

    #[test]
    fn retains_at_most_max_rounds() {
        let mut dialogue = Dialogue::new("prompt", 3);
        for n in 0..4 {
            round(&mut dialogue, n);
        }

        assert_eq!(dialogue.rounds(), 3);
        // The oldest round was evicted.
        assert_eq!(
            dialogue.messages()[0].content.as_deref(),
            Some("question 1")
        );
        assert_eq!(
            dialogue.messages().last().unwrap().content.as_deref(),
            Some("answer 3")
        );
    }

    #[test]
    fn eviction_drops_tool_messages_of_the_round() {
        let mut dialogue = Dialogue::new("prompt", 1);
        dialogue.push(Message::user("q1"));
        dialogue.push(Message::assistant_tool_calls(vec![ToolCallRef {
            id: "c1".into(),
            name: "clock".into(),
            arguments: "{}".into(),
        }]));
        dialogue.push(Message::tool("c1", "noon"));
        dialogue.push(Message::assistant("a1"));
        dialogue.push(Message::user("q2"));

        assert_eq!(dialogue.rounds(), 1);
        assert_eq!(dialogue.messages().len(), 1);
        assert_eq!(dialogue.messages()[0].content.as_deref(), Some("q2"));
    }

    #[test]
    fn exactly_one_system_message_after_update() {
        let mut dialogue = Dialogue::new("old prompt", 5);
        round(&mut dialogue, 0);
        dialogue.update_system("new prompt");
        round(&mut dialogue, 1);

        let rendered = dialogue.render_with_context(None);
        let systems: Vec<_> = rendered
            .iter()
            .filter(|m| m.role == Role::System)
            .collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].content.as_deref(), Some("new prompt"));
        assert_eq!(rendered[0].role, Role::System);
    }

    #[test]
    fn render_appends_memory_to_system_message() {
        let mut dialogue = Dialogue::new("prompt", 5);
        dialogue.push(Message::user("hello"));

        let rendered = dialogue.render_with_context(Some("the user likes jazz"));
        let system = rendered[0].content.as_deref().unwrap();
        assert!(system.starts_with("prompt"));
        assert!(system.contains("the user likes jazz"));

        // Empty summaries are not appended.
        let rendered = dialogue.render_with_context(Some(""));
        assert_eq!(rendered[0].content.as_deref(), Some("prompt"));
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Tool.to_string(), "tool");
    }

    #[test]
    fn role_serialization_is_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        let role: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(role, Role::System);
    }
}
