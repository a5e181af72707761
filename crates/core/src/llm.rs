//! Language-model capability: streamed generation with tool-call deltas.
//!
//! A model invocation yields a stream of [`LlmEvent`]s, each either a chunk
//! of freeform text or a fragment of a tool call. Fragments for concurrently
//! streamed calls are merged by index through [`PendingToolCalls`] before
//! dispatch.

use crate::dialogue::{Message, Role};
use crate::tools::ToolCall;
use anyhow::{Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use uuid::Uuid;

/// One fragment of a streamed tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    /// Merge key while streaming; fragments without an index attach to the
    /// most recently opened call.
    pub index: Option<usize>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One unit of streamed model output.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Text(String),
    ToolCall(ToolCallDelta),
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmEvent>> + Send>>;

/// A tool surfaced to the model as a callable function.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema for the argument object.
    pub parameters: serde_json::Value,
}

/// A generic streaming chat model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Starts one generation over the rendered dialogue. When `tools` is
    /// `None` the model must answer in plain text.
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<&[ToolDeclaration]>,
    ) -> Result<LlmStream>;
}

/// Accumulates streamed tool-call fragments, keyed by index.
///
/// Name text accumulates, argument text appends, and the id is set once.
/// A fragment without an index opens a new call when it carries a name and
/// otherwise appends to the most recently opened call.
#[derive(Debug, Default)]
pub struct PendingToolCalls {
    calls: Vec<PendingCall>,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCalls {
    pub fn merge(&mut self, delta: ToolCallDelta) {
        let index = delta.index.unwrap_or_else(|| {
            if delta.name.is_some() {
                self.calls.len()
            } else {
                self.calls.len().saturating_sub(1)
            }
        });
        while index >= self.calls.len() {
            self.calls.push(PendingCall::default());
        }
        let call = &mut self.calls[index];
        if let Some(id) = delta.id
            && !id.is_empty()
        {
            call.id = id;
        }
        if let Some(name) = delta.name {
            call.name.push_str(&name);
        }
        if let Some(arguments) = delta.arguments {
            call.arguments.push_str(&arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Fully assembled calls, in stream order. Calls without a name or with
    /// an unparseable argument payload are not dispatchable and are skipped.
    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(|call| {
                if call.name.is_empty() {
                    tracing::warn!("discarding streamed tool call without a name");
                    return None;
                }
                let arguments = if call.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                };
                if serde_json::from_str::<serde_json::Value>(&arguments).is_err() {
                    tracing::warn!(name = %call.name, "discarding tool call with malformed arguments");
                    return None;
                }
                let id = if call.id.is_empty() {
                    Uuid::new_v4().simple().to_string()
                } else {
                    call.id
                };
                Some(ToolCall {
                    id,
                    name: call.name,
                    arguments,
                })
            })
            .collect()
    }
}

/// An implementation of [`LanguageModel`] for any OpenAI-compatible API.
pub struct OpenAiCompatibleModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompatibleModel {
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<&[ToolDeclaration]>,
    ) -> Result<LlmStream> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(to_request_messages(&messages)?)
            .stream(true);
        if let Some(tools) = tools
            && !tools.is_empty()
        {
            builder
                .tools(to_request_tools(tools)?)
                .tool_choice("auto");
        }
        let request = builder.build()?;

        let stream = self.client.chat().create_stream(request).await?;
        let mapped = stream.flat_map(|result| {
            let events: Vec<Result<LlmEvent>> = match result {
                Ok(response) => {
                    let mut out = Vec::new();
                    if let Some(choice) = response.choices.first() {
                        if let Some(content) = &choice.delta.content
                            && !content.is_empty()
                        {
                            out.push(Ok(LlmEvent::Text(content.clone())));
                        }
                        if let Some(calls) = &choice.delta.tool_calls {
                            for call in calls {
                                out.push(Ok(LlmEvent::ToolCall(ToolCallDelta {
                                    index: Some(call.index as usize),
                                    id: call.id.clone(),
                                    name: call
                                        .function
                                        .as_ref()
                                        .and_then(|f| f.name.clone()),
                                    arguments: call
                                        .function
                                        .as_ref()
                                        .and_then(|f| f.arguments.clone()),
                                })));
                            }
                        }
                    }
                    out
                }
                Err(e) => vec![Err(anyhow!(e))],
            };
            futures::stream::iter(events)
        });
        Ok(Box::pin(mapped))
    }
}

fn to_request_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let content = message.content.clone().unwrap_or_default();
        let converted: ChatCompletionRequestMessage = match message.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            Role::Assistant => {
                let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                if let Some(text) = &message.content {
                    builder.content(text.clone());
                }
                if let Some(calls) = &message.tool_calls {
                    builder.tool_calls(
                        calls
                            .iter()
                            .map(|c| ChatCompletionMessageToolCall {
                                id: c.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: c.name.clone(),
                                    arguments: c.arguments.clone(),
                                },
                            })
                            .collect::<Vec<_>>(),
                    );
                }
                builder.build()?.into()
            }
            Role::Tool => ChatCompletionRequestToolMessageArgs::default()
                .tool_call_id(message.tool_call_id.clone().unwrap_or_default())
                .content(content)
                .build()?
                .into(),
        };
        out.push(converted);
    }
    Ok(out)
}

fn to_request_tools(tools: &[ToolDeclaration]) -> Result<Vec<ChatCompletionTool>> {
    tools
        .iter()
        .map(|t| {
            Ok(ChatCompletionToolArgs::default()
                .function(
                    FunctionObjectArgs::default()
                        .name(&t.name)
                        .description(&t.description)
                        .parameters(t.parameters.clone())
                        .build()?,
                )
                .build()?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_split_arguments_by_index() {
        let mut pending = PendingToolCalls::default();
        pending.merge(ToolCallDelta {
            index: Some(0),
            id: Some("call_1".into()),
            name: Some("weather".into()),
            arguments: Some("{\"city\":".into()),
        });
        pending.merge(ToolCallDelta {
            index: Some(0),
            id: None,
            name: None,
            arguments: Some("\"X\"}".into()),
        });

        let calls = pending.into_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "weather");
        assert_eq!(calls[0].arguments, "{\"city\":\"X\"}");
    }

    #[test]
    fn merges_two_concurrent_calls_without_collision() {
        let mut pending = PendingToolCalls::default();
        pending.merge(ToolCallDelta {
            index: Some(0),
            id: Some("a".into()),
            name: Some("clock".into()),
            arguments: None,
        });
        pending.merge(ToolCallDelta {
            index: Some(1),
            id: Some("b".into()),
            name: Some("weather".into()),
            arguments: Some("{\"city\":\"X\"}".into()),
        });
        pending.merge(ToolCallDelta {
            index: Some(0),
            id: None,
            name: None,
            arguments: Some("{}".into()),
        });

        let calls = pending.into_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "clock");
        assert_eq!(calls[0].arguments, "{}");
        assert_eq!(calls[1].name, "weather");
    }

    #[test]
    fn unindexed_delta_with_name_opens_new_call() {
        let mut pending = PendingToolCalls::default();
        pending.merge(ToolCallDelta {
            index: None,
            id: None,
            name: Some("clock".into()),
            arguments: None,
        });
        pending.merge(ToolCallDelta {
            index: None,
            id: None,
            name: None,
            arguments: Some("{}".into()),
        });

        let calls = pending.into_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "clock");
        assert_eq!(calls[0].arguments, "{}");
    }

    #[test]
    fn empty_arguments_default_to_empty_object() {
        let mut pending = PendingToolCalls::default();
        pending.merge(ToolCallDelta {
            index: Some(0),
            id: None,
            name: Some("clock".into()),
            arguments: None,
        });

        let calls = pending.into_calls();
        assert_eq!(calls[0].arguments, "{}");
        assert!(!calls[0].id.is_empty(), "missing ids are generated");
    }

    #[test]
    fn malformed_or_nameless_calls_are_not_dispatchable() {
        let mut pending = PendingToolCalls::default();
        pending.merge(ToolCallDelta {
            index: Some(0),
            id: None,
            name: Some("weather".into()),
            arguments: Some("{\"city\":".into()),
        });
        pending.merge(ToolCallDelta {
            index: Some(1),
            id: None,
            name: None,
            arguments: Some("{}".into()),
        });

        assert!(pending.into_calls().is_empty());
    }

    #[test]
    fn request_message_conversion_covers_all_roles() {
        use crate::dialogue::ToolCallRef;

        let messages = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::assistant_tool_calls(vec![ToolCallRef {
                id: "c1".into(),
                name: "clock".into(),
                arguments: "{}".into(),
            }]),
            Message::tool("c1", "noon"),
        ];

        let converted = to_request_messages(&messages).unwrap();
        assert_eq!(converted.len(), 5);
    }
}
