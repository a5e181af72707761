//! Drives one user turn through the language model and the tool registry.
//!
//! A turn streams model output into sentence-sized TTS units, assembles any
//! tool calls the model requests (structured deltas or the `<tool_call>`
//! textual convention), dispatches them concurrently, and feeds `ReqLlm`
//! results back to the model as a bounded sub-turn. Whatever happens in
//! between, a turn emits exactly one FIRST unit and exactly one LAST unit.

use crate::ws::protocol::ServerMessage;
use anyhow::{Context, Result};
use futures::StreamExt;
use futures::future::{BoxFuture, join_all};
use murmur_core::{
    dialogue::{Dialogue, Message, ToolCallRef},
    llm::{LanguageModel, LlmEvent, PendingToolCalls},
    memory::Memory,
    speech::TtsUnit,
    tools::{Action, ToolCall, ToolRegistry},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

const TOOL_CALL_TAG: &str = "<tool_call>";

/// Nested tool sub-turns beyond this depth force a plain final answer.
pub const MAX_TOOL_DEPTH: usize = 5;

/// What a finished turn asks of the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnOutcome {
    /// A tool requested that the session close once playback finishes.
    pub hang_up: bool,
}

pub struct TurnRunner {
    pub llm: Arc<dyn LanguageModel>,
    pub tools: Option<Arc<ToolRegistry>>,
    pub memory: Option<Arc<dyn Memory>>,
    pub tts_tx: mpsc::Sender<TtsUnit>,
    /// Out-of-band notices for the device (emotion hints).
    pub notice_tx: mpsc::Sender<ServerMessage>,
    /// Cooperative abort, polled between streamed units.
    pub abort: Arc<AtomicBool>,
    pub max_depth: usize,
}

impl TurnRunner {
    /// Runs one full turn for the given user text.
    pub async fn run(&self, dialogue: Arc<Mutex<Dialogue>>, user_text: String) -> TurnOutcome {
        let turn_id = Uuid::new_v4();

        let memory_context = match &self.memory {
            Some(memory) => match memory.query(&user_text).await {
                Ok(context) => context,
                Err(e) => {
                    warn!(error = ?e, "memory query failed, continuing without context");
                    None
                }
            },
            None => None,
        };

        dialogue.lock().await.push(Message::user(&user_text));

        let _ = self.tts_tx.send(TtsUnit::first(turn_id)).await;
        let outcome = self
            .step(&dialogue, turn_id, memory_context.as_deref(), 0)
            .await;
        let hang_up = match outcome {
            Ok(hang_up) => hang_up,
            Err(e) => {
                error!(error = ?e, "turn failed");
                false
            }
        };
        let _ = self.tts_tx.send(TtsUnit::last(turn_id)).await;

        TurnOutcome { hang_up }
    }

    /// One model invocation at the given tool-recursion depth. Returns the
    /// accumulated hang-up request.
    fn step<'a>(
        &'a self,
        dialogue: &'a Arc<Mutex<Dialogue>>,
        turn_id: Uuid,
        memory_context: Option<&'a str>,
        depth: usize,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let forced_final = depth >= self.max_depth;
            if forced_final {
                debug!(depth, "tool recursion ceiling reached, forcing a final answer");
                dialogue.lock().await.push(Message::user(
                    "Answer the user directly now. Do not call any more tools.",
                ));
            }
            let declarations = if forced_final {
                None
            } else {
                self.tools.as_ref().map(|t| t.declarations())
            };

            let messages = dialogue.lock().await.render_with_context(memory_context);
            let mut stream = self
                .llm
                .generate(messages, declarations.as_deref())
                .await
                .context("language model request failed")?;

            let mut assistant_text = String::new();
            let mut sentence_buf = String::new();
            let mut payload = String::new();
            let mut textual_tool = false;
            let mut emotion_sent = depth > 0;
            let mut pending = PendingToolCalls::default();
            let mut stream_error: Option<anyhow::Error> = None;

            while let Some(event) = stream.next().await {
                if self.abort.load(Ordering::Relaxed) {
                    debug!("turn aborted by client");
                    break;
                }
                match event {
                    Ok(LlmEvent::Text(chunk)) => {
                        if textual_tool {
                            payload.push_str(&chunk);
                            continue;
                        }
                        if !pending.is_empty() {
                            // A tool call is already underway; text after the
                            // signal stays unspoken.
                            debug!("withholding text after a tool-call delta");
                            continue;
                        }
                        if !emotion_sent && !chunk.trim().is_empty() {
                            emotion_sent = true;
                            let _ = self
                                .notice_tx
                                .send(ServerMessage::Llm {
                                    emotion: detect_emotion(&chunk).to_string(),
                                })
                                .await;
                        }
                        assistant_text.push_str(&chunk);
                        sentence_buf.push_str(&chunk);
                        let head = assistant_text.trim_start();
                        if head.starts_with(TOOL_CALL_TAG) {
                            // Everything after the tag is tool-call payload,
                            // withheld from speech.
                            textual_tool = true;
                            payload = head[TOOL_CALL_TAG.len()..].to_string();
                            assistant_text.clear();
                            sentence_buf.clear();
                            continue;
                        }
                        if TOOL_CALL_TAG.starts_with(head) {
                            // Could still become the tag; keep buffering.
                            continue;
                        }
                        for sentence in take_complete_sentences(&mut sentence_buf) {
                            self.say(turn_id, &sentence).await;
                        }
                    }
                    Ok(LlmEvent::ToolCall(delta)) => pending.merge(delta),
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }

            // Flush whatever was spoken before recursing or bailing, so the
            // dialogue reflects the audible output.
            if !textual_tool {
                let tail = sentence_buf.trim();
                if !tail.is_empty() && pending.is_empty() {
                    self.say(turn_id, tail).await;
                }
            }
            let has_pending = !pending.is_empty();
            if has_pending {
                // Only the sentences already sent to synthesis were audible;
                // record exactly those so the history matches playback.
                let spoken = assistant_text[..assistant_text.len() - sentence_buf.len()].trim();
                if !spoken.is_empty() {
                    dialogue.lock().await.push(Message::assistant(spoken));
                }
            } else if !assistant_text.trim().is_empty() {
                dialogue
                    .lock()
                    .await
                    .push(Message::assistant(assistant_text.trim()));
            }

            if let Some(e) = stream_error {
                return Err(e).context("language model stream failed");
            }

            let calls = if has_pending {
                pending.into_calls()
            } else if textual_tool {
                match parse_textual_tool_call(&payload) {
                    Some(call) => vec![call],
                    None => {
                        // Not a well-formed call after all; speak it.
                        warn!("unparseable textual tool call, emitting as plain text");
                        let text = payload.trim().trim_end_matches("</tool_call>").trim();
                        if !text.is_empty() {
                            self.say(turn_id, text).await;
                            dialogue.lock().await.push(Message::assistant(text));
                        }
                        return Ok(false);
                    }
                }
            } else {
                return Ok(false);
            };

            if calls.is_empty() {
                return Ok(false);
            }
            self.handle_tool_calls(dialogue, turn_id, memory_context, depth, calls)
                .await
        })
    }

    /// Dispatches assembled calls concurrently and routes each outcome.
    async fn handle_tool_calls(
        &self,
        dialogue: &Arc<Mutex<Dialogue>>,
        turn_id: Uuid,
        memory_context: Option<&str>,
        depth: usize,
        calls: Vec<ToolCall>,
    ) -> Result<bool> {
        let registry = self
            .tools
            .as_ref()
            .context("model requested a tool but no registry is configured")?;

        let outcomes = join_all(calls.iter().map(|call| registry.dispatch(call))).await;

        let mut hang_up = false;
        let mut feedback: Vec<(ToolCall, String)> = Vec::new();
        for (call, outcome) in calls.into_iter().zip(outcomes) {
            hang_up |= outcome.hang_up;
            match outcome.action {
                Action::ReqLlm => {
                    feedback.push((call, outcome.result.unwrap_or_default()));
                }
                Action::Response | Action::NotFound | Action::Error => {
                    if let Some(text) = outcome.spoken_text() {
                        self.say(turn_id, text).await;
                        dialogue.lock().await.push(Message::assistant(text));
                    }
                }
                Action::None => {}
            }
        }

        if !feedback.is_empty() {
            {
                let mut dialogue = dialogue.lock().await;
                dialogue.push(Message::assistant_tool_calls(
                    feedback
                        .iter()
                        .map(|(call, _)| ToolCallRef {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        })
                        .collect(),
                ));
                for (call, result) in &feedback {
                    dialogue.push(Message::tool(&call.id, result));
                }
            }
            hang_up |= self
                .step(dialogue, turn_id, memory_context, depth + 1)
                .await?;
        }
        Ok(hang_up)
    }

    async fn say(&self, turn_id: Uuid, text: &str) {
        let _ = self.tts_tx.send(TtsUnit::middle(turn_id, text)).await;
    }
}

/// Splits off the complete sentences at the front of the buffer, leaving any
/// unterminated tail in place.
fn take_complete_sentences(buffer: &mut String) -> Vec<String> {
    let mut boundary = None;
    for (i, c) in buffer.char_indices() {
        if matches!(c, '.' | '!' | '?' | ';' | '\n' | '。' | '！' | '？' | '；') {
            boundary = Some(i + c.len_utf8());
        }
    }
    let Some(end) = boundary else {
        return Vec::new();
    };
    let head: String = buffer.drain(..end).collect();
    head.split_inclusive(['.', '!', '?', ';', '\n', '。', '！', '？', '；'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses the first balanced JSON object out of a `<tool_call>` payload and
/// reads the `name`/`arguments` convention from it.
fn parse_textual_tool_call(payload: &str) -> Option<ToolCall> {
    let object = extract_json_object(payload)?;
    let value: serde_json::Value = serde_json::from_str(object).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let arguments = value
        .get("arguments")
        .map(|a| a.to_string())
        .unwrap_or_else(|| "{}".to_string());
    Some(ToolCall {
        id: Uuid::new_v4().simple().to_string(),
        name,
        arguments,
    })
}

/// Returns the first balanced `{...}` region, honoring string literals and
/// escapes.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Coarse emotion hint from the opening of the model's reply.
fn detect_emotion(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    const TABLE: &[(&str, &[&str])] = &[
        ("happy", &["haha", "great", "glad", "wonderful", "nice"]),
        ("sad", &["sorry", "sadly", "unfortunately", "afraid"]),
        ("surprised", &["wow", "amazing", "incredible", "surprise"]),
        ("angry", &["angry", "furious", "outrage"]),
    ];
    for (emotion, keywords) in TABLE {
        if keywords.iter().any(|k| lower.contains(k)) {
            return emotion;
        }
    }
    "neutral"
}
