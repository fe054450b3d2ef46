//! Streaming tool-call reconstruction
//!
//! Tool calls arrive as fragments keyed by `index`: the id and function name
//! show up on some fragments only, and the argument string is split across
//! many. Fragments are buffered per index and a `tool_call` chunk is emitted
//! as soon as every buffered argument string is a complete JSON object.
//! Text deltas pass straight through.

use std::collections::BTreeMap;

use agent_core::error::AgentError;
use agent_core::provider::{FinishReason, StreamChunk, TokenUsage};
use agent_core::tool::{Parameters, ToolCall};

use super::wire::{self, ChatCompletionChunk, ToolCallDelta};

/// Index-keyed fragment buffers for one assistant turn
#[derive(Debug, Default)]
struct ToolCallBuffer {
    ids: BTreeMap<usize, String>,
    names: BTreeMap<usize, String>,
    arguments: BTreeMap<usize, String>,

    /// Successful parses, dropped whenever that index's arguments grow
    parsed: BTreeMap<usize, Parameters>,
}

impl ToolCallBuffer {
    fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    fn push(&mut self, delta: ToolCallDelta) {
        let index = delta.index;
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            self.ids.insert(index, id);
        }

        let arguments = self.arguments.entry(index).or_default();
        if let Some(function) = delta.function {
            if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                self.names.insert(index, name);
            }
            if let Some(fragment) = function.arguments.filter(|f| !f.is_empty()) {
                arguments.push_str(&fragment);
                self.parsed.remove(&index);
            }
        }
    }

    /// Whether every buffered argument string parses as a JSON object
    fn is_complete(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        for (index, raw) in &self.arguments {
            if self.parsed.contains_key(index) {
                continue;
            }
            match try_parse(raw) {
                Some(params) => {
                    self.parsed.insert(*index, params);
                }
                None => return false,
            }
        }
        true
    }

    /// Drain into tool calls, in index order
    ///
    /// Empty argument strings decode as `{}`. Fails on the first buffer that
    /// is not a JSON object or has no function name.
    fn drain(&mut self) -> Result<Vec<ToolCall>, String> {
        let arguments = std::mem::take(&mut self.arguments);
        let mut ids = std::mem::take(&mut self.ids);
        let mut names = std::mem::take(&mut self.names);
        let mut parsed = std::mem::take(&mut self.parsed);

        arguments
            .into_iter()
            .map(|(index, raw)| {
                let parameters = match parsed.remove(&index) {
                    Some(params) => params,
                    None => wire::parse_arguments(&raw)
                        .map_err(|e| format!("tool call {index}: {}", e.detail()))?,
                };
                let name = names
                    .remove(&index)
                    .ok_or_else(|| format!("tool call {index} has no function name"))?;
                let id = ids.remove(&index).unwrap_or_else(|| format!("call_{index}"));
                Ok(ToolCall::new(id, name, parameters))
            })
            .collect()
    }
}

/// Parse a buffered argument string if it can already be complete
fn try_parse(raw: &str) -> Option<Parameters> {
    let raw = raw.trim();
    if !raw.ends_with('}') {
        return None;
    }
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(params)) => Some(params),
        _ => None,
    }
}

/// Turns SSE `data:` payloads into [`StreamChunk`]s
#[derive(Debug, Default)]
pub struct StreamNormalizer {
    buffer: ToolCallBuffer,
    finish_reason: Option<FinishReason>,
    usage: TokenUsage,
    done: bool,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal chunk has been produced
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one `data:` payload
    pub fn on_data(&mut self, data: &str) -> Vec<StreamChunk> {
        let data = data.trim();
        if self.done || data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable SSE line");
                return Vec::new();
            }
        };

        if let Some(usage) = chunk.usage {
            self.usage = usage.into();
        }

        let mut out = Vec::new();
        let mut finished = false;

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(StreamChunk::Delta { content });
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                self.buffer.push(delta);
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(wire::finish_reason(Some(&reason)));
                finished = true;
            }
        }

        if finished || self.buffer.is_complete() {
            out.extend(self.flush());
        }
        out
    }

    /// The body ended; recover if no `[DONE]` was seen
    pub fn end_of_stream(&mut self) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        tracing::warn!("stream ended without [DONE], treating as stop");
        self.finish()
    }

    fn flush(&mut self) -> Option<StreamChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        match self.buffer.drain() {
            Ok(tool_calls) => Some(StreamChunk::ToolCall { tool_calls }),
            Err(message) => {
                self.done = true;
                Some(StreamChunk::error(&AgentError::Protocol(message)))
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out: Vec<StreamChunk> = self.flush().into_iter().collect();
        if !self.done {
            self.done = true;
            out.push(StreamChunk::Done {
                finish_reason: self.finish_reason.unwrap_or(FinishReason::Stop),
                usage: self.usage,
            });
        }
        out
    }
}
