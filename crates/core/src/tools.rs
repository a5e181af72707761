//! Closed tool registry for model-requested function calls.
//!
//! Tool names map to a closed set of capability handlers resolved at
//! startup; there is no runtime registration. Each dispatch returns a
//! [`ToolOutcome`] whose action tells the orchestrator whether to speak the
//! result directly or feed it back to the model for another turn.

use crate::llm::ToolDeclaration;
use crate::tasks::{TaskStore, TaskStatus};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

/// A fully assembled, dispatchable tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// How the orchestrator must treat a tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Speak the response text directly; this call's contribution is done.
    Response,
    /// Feed the result back to the model as a tool message and recurse.
    ReqLlm,
    /// The requested entity or tool does not exist; spoken directly.
    NotFound,
    /// The call failed; the error text is spoken directly.
    Error,
    /// Nothing to do.
    None,
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub action: Action,
    /// Machine-facing result text, fed back to the model on `ReqLlm`.
    pub result: Option<String>,
    /// User-facing response text, preferred for speech when present.
    pub response: Option<String>,
    /// Set when the tool asks the session to close after this turn.
    pub hang_up: bool,
}

impl ToolOutcome {
    pub fn response(text: impl Into<String>) -> Self {
        Self {
            action: Action::Response,
            result: None,
            response: Some(text.into()),
            hang_up: false,
        }
    }

    pub fn req_llm(result: impl Into<String>) -> Self {
        Self {
            action: Action::ReqLlm,
            result: Some(result.into()),
            response: None,
            hang_up: false,
        }
    }

    pub fn not_found(text: impl Into<String>) -> Self {
        Self {
            action: Action::NotFound,
            result: None,
            response: Some(text.into()),
            hang_up: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            action: Action::Error,
            result: None,
            response: Some(text.into()),
            hang_up: false,
        }
    }

    /// The text to speak for direct-response actions.
    pub fn spoken_text(&self) -> Option<&str> {
        self.response.as_deref().or(self.result.as_deref())
    }
}

/// The closed set of capability handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Reports the current server time; result goes back through the model.
    Clock,
    /// Queries the injected [`TaskStore`] for a background task.
    TaskStatus,
    /// Ends the conversation after the current turn completes.
    EndConversation,
}

/// Startup-resolved mapping from stable tool names to capabilities.
pub struct ToolRegistry {
    entries: HashMap<String, Capability>,
    tasks: TaskStore,
}

impl ToolRegistry {
    /// Builds the registry with the built-in capability set.
    pub fn with_builtins(tasks: TaskStore) -> Self {
        let entries = HashMap::from([
            ("get_time".to_string(), Capability::Clock),
            ("task_status".to_string(), Capability::TaskStatus),
            ("end_conversation".to_string(), Capability::EndConversation),
        ]);
        Self { entries, tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declarations surfaced to the language model.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut names: Vec<_> = self.entries.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| match self.entries[&name] {
                Capability::Clock => ToolDeclaration {
                    name,
                    description: "Get the current date and time.".to_string(),
                    parameters: json!({"type": "object", "properties": {}}),
                },
                Capability::TaskStatus => ToolDeclaration {
                    name,
                    description: "Check the status of a background task by id.".to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "task_id": {"type": "string", "description": "Identifier of the task to query."}
                        },
                        "required": ["task_id"]
                    }),
                },
                Capability::EndConversation => ToolDeclaration {
                    name,
                    description: "End the conversation when the user says goodbye.".to_string(),
                    parameters: json!({"type": "object", "properties": {}}),
                },
            })
            .collect()
    }

    /// Dispatches one assembled call. Never fails: unknown tools and
    /// malformed arguments come back as `NotFound`/`Error` outcomes.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutcome {
        let Some(capability) = self.entries.get(&call.name) else {
            tracing::warn!(name = %call.name, "model requested an unknown tool");
            return ToolOutcome::not_found(format!("I don't have a tool called {}.", call.name));
        };
        let arguments: serde_json::Value = match serde_json::from_str(&call.arguments) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(name = %call.name, error = %e, "malformed tool arguments");
                return ToolOutcome::error("The tool call arguments could not be parsed.");
            }
        };

        match capability {
            Capability::Clock => ToolOutcome::req_llm(format!(
                "The current server time is {}.",
                Utc::now().to_rfc3339()
            )),
            Capability::TaskStatus => {
                let Some(task_id) = arguments.get("task_id").and_then(|v| v.as_str()) else {
                    return ToolOutcome::error("task_id is required.");
                };
                match self.tasks.take(task_id) {
                    Some(state) => ToolOutcome::response(describe_task(&state)),
                    None => ToolOutcome::not_found(format!("No task with id {task_id}.")),
                }
            }
            Capability::EndConversation => {
                let mut outcome = ToolOutcome::response("Goodbye.");
                outcome.hang_up = true;
                outcome
            }
        }
    }
}

fn describe_task(state: &crate::tasks::TaskState) -> String {
    match state.status {
        TaskStatus::Running => format!(
            "Task {} is still running, {}% complete.",
            state.id, state.progress
        ),
        TaskStatus::Succeeded => format!(
            "Task {} finished: {}",
            state.id,
            state.result.as_deref().unwrap_or("no result recorded")
        ),
        TaskStatus::NotFound => format!("Task {} found nothing.", state.id),
        TaskStatus::Failed => format!(
            "Task {} failed: {}",
            state.id,
            state.result.as_deref().unwrap_or("unknown error")
        ),
        TaskStatus::Cancelled => format!("Task {} was cancelled.", state.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::with_builtins(TaskStore::new());
        let outcome = registry.dispatch(&call("weather", "{}")).await;
        assert_eq!(outcome.action, Action::NotFound);
        assert!(outcome.spoken_text().unwrap().contains("weather"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_an_error_outcome() {
        let registry = ToolRegistry::with_builtins(TaskStore::new());
        let outcome = registry.dispatch(&call("get_time", "{not json")).await;
        assert_eq!(outcome.action, Action::Error);
    }

    #[tokio::test]
    async fn clock_feeds_back_through_the_model() {
        let registry = ToolRegistry::with_builtins(TaskStore::new());
        let outcome = registry.dispatch(&call("get_time", "{}")).await;
        assert_eq!(outcome.action, Action::ReqLlm);
        assert!(outcome.result.unwrap().contains("server time"));
    }

    #[tokio::test]
    async fn task_status_reports_and_collects() {
        let tasks = TaskStore::new();
        tasks.begin("song-1");
        tasks.finish("song-1", TaskStatus::Succeeded, Some("found it".into()));
        let registry = ToolRegistry::with_builtins(tasks.clone());

        let outcome = registry
            .dispatch(&call("task_status", "{\"task_id\":\"song-1\"}"))
            .await;
        assert_eq!(outcome.action, Action::Response);
        assert!(outcome.spoken_text().unwrap().contains("found it"));
        assert!(tasks.is_empty(), "terminal task collected after query");

        let outcome = registry
            .dispatch(&call("task_status", "{\"task_id\":\"song-1\"}"))
            .await;
        assert_eq!(outcome.action, Action::NotFound);
    }

    #[tokio::test]
    async fn end_conversation_requests_hang_up() {
        let registry = ToolRegistry::with_builtins(TaskStore::new());
        let outcome = registry.dispatch(&call("end_conversation", "{}")).await;
        assert_eq!(outcome.action, Action::Response);
        assert!(outcome.hang_up);
    }

    #[test]
    fn declarations_cover_every_entry() {
        let registry = ToolRegistry::with_builtins(TaskStore::new());
        let declarations = registry.declarations();
        let names: Vec<_> = declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["end_conversation", "get_time", "task_status"]);
        for declaration in &declarations {
            assert!(declaration.parameters.get("type").is_some());
        }
    }
}
