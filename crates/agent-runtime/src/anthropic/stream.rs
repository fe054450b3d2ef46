//! Anthropic SSE event handling

use std::collections::BTreeMap;

use agent_core::error::AgentError;
use agent_core::provider::{FinishReason, StreamChunk};
use agent_core::tool::ToolCall;
use serde::Deserialize;
use serde_json::Value;

use super::wire::{self, WireUsage};

/// Typed SSE events of the Messages API
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorDetail,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StartMessage {
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// A `tool_use` block whose input is still arriving
#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

impl PendingToolUse {
    fn finish(self) -> Result<ToolCall, String> {
        let input = if self.json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.json)
                .map_err(|e| format!("tool_use {} input is not valid JSON: {e}", self.id))?
        };
        let parameters = wire::input_parameters(input).map_err(|e| e.detail())?;
        Ok(ToolCall::new(self.id, self.name, parameters))
    }
}

/// Turns Messages API events into [`StreamChunk`]s
///
/// Tool calls completed at `content_block_stop` are held back and emitted as
/// one batch once the stop reason is known.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    pending: BTreeMap<u32, PendingToolUse>,
    ready: Vec<ToolCall>,
    usage: WireUsage,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one `data:` payload
    pub fn on_data(&mut self, data: &str) -> Vec<StreamChunk> {
        let data = data.trim();
        if self.done || data.is_empty() {
            return Vec::new();
        }

        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable Anthropic SSE event");
                return Vec::new();
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.usage = usage;
                }
                Vec::new()
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StartBlock::Text { text } if !text.is_empty() => {
                    vec![StreamChunk::Delta { content: text }]
                }
                StartBlock::ToolUse { id, name } => {
                    self.pending.insert(
                        index,
                        PendingToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    );
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![StreamChunk::Delta { content: text }]
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(pending) = self.pending.get_mut(&index) {
                        pending.json.push_str(&partial_json);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => match self.pending.remove(&index) {
                Some(pending) => match pending.finish() {
                    Ok(call) => {
                        self.ready.push(call);
                        Vec::new()
                    }
                    Err(message) => self.fail(AgentError::Protocol(message)),
                },
                None => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        self.usage.input_tokens = usage.input_tokens;
                    }
                }
                match delta.stop_reason {
                    Some(reason) => {
                        self.finish_reason = Some(wire::stop_reason(Some(&reason)));
                        self.flush().into_iter().collect()
                    }
                    None => Vec::new(),
                }
            }
            StreamEvent::MessageStop => self.finish(),
            StreamEvent::Error { error } => {
                self.fail(AgentError::Transport(format!("{}: {}", error.kind, error.message)))
            }
            StreamEvent::Ping | StreamEvent::Unknown => Vec::new(),
        }
    }

    /// The body ended; recover if no `message_stop` was seen
    pub fn end_of_stream(&mut self) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        tracing::warn!("stream ended without message_stop, treating as stop");

        let pending = std::mem::take(&mut self.pending);
        for (_, block) in pending {
            match block.finish() {
                Ok(call) => self.ready.push(call),
                Err(message) => return self.fail(AgentError::Protocol(message)),
            }
        }
        self.finish()
    }

    fn flush(&mut self) -> Option<StreamChunk> {
        if self.ready.is_empty() {
            return None;
        }
        Some(StreamChunk::ToolCall {
            tool_calls: std::mem::take(&mut self.ready),
        })
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out: Vec<StreamChunk> = self.flush().into_iter().collect();
        self.done = true;
        out.push(StreamChunk::Done {
            finish_reason: self.finish_reason.unwrap_or(FinishReason::Stop),
            usage: self.usage.into(),
        });
        out
    }

    fn fail(&mut self, err: AgentError) -> Vec<StreamChunk> {
        self.done = true;
        vec![StreamChunk::error(&err)]
    }
}
