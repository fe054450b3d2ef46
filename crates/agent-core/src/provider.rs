//! LLM Provider Strategy Pattern
//!
//! Defines the common interface every wire protocol implements (OpenAI-compatible,
//! Anthropic, ...) so the agent loop works with any backend without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{GenerationOptions, LlmProvider};
//!
//! let response = provider
//!     .chat_completion(&messages, &tools, &GenerationOptions::default())
//!     .await?;
//! ```

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::tool::{ToolCall, ToolSchema};

/// Per-call generation settings
///
/// `temperature` and `max_tokens` are passed to the provider verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Temperature for sampling
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Upper bound for this single HTTP call
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: None,
        }
    }
}

impl GenerationOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Token usage statistics, normalized across providers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Reason for completion finishing
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Error,
    Unknown,
}

/// Response from a non-streaming completion
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Provider-assigned response id
    pub id: String,

    /// Assistant message
    pub message: Message,

    /// Copy of `message.tool_calls`
    pub tool_calls: Vec<ToolCall>,

    /// Token usage
    pub usage: TokenUsage,

    /// Finish reason
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Build a response, keeping `tool_calls` and `message.tool_calls` in sync
    pub fn new(
        id: impl Into<String>,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
        usage: TokenUsage,
        finish_reason: FinishReason,
    ) -> Self {
        Self {
            id: id.into(),
            message: Message::assistant_with_tool_calls(content, tool_calls.clone()),
            tool_calls,
            usage,
            finish_reason,
        }
    }
}

/// One unit of an incrementally delivered response
///
/// Exactly one terminal chunk (`Done` or `Error`) ends a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Text fragment
    Delta { content: String },

    /// Complete, parsed tool calls
    ToolCall { tool_calls: Vec<ToolCall> },

    /// Tool output, emitted by the agent loop for observability
    ToolResult {
        tool_call_id: String,
        name: String,
        content: String,
    },

    /// Terminal success
    Done {
        finish_reason: FinishReason,
        usage: TokenUsage,
    },

    /// Terminal failure, `kind` is the [`AgentError::kind`] code
    Error { kind: String, message: String },
}

impl StreamChunk {
    /// Terminal chunk describing `err`
    pub fn error(err: &AgentError) -> Self {
        StreamChunk::Error {
            kind: err.kind().to_string(),
            message: err.detail(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Done { .. } | StreamChunk::Error { .. })
    }
}

/// Stream type for completion streaming
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for a new wire protocol.
/// The agent loop works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion from messages
    async fn chat_completion(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChatResponse>;

    /// Generate a streaming completion
    async fn chat_completion_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChunkStream>;
}
