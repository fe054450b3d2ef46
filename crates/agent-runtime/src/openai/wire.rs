//! OpenAI chat completions wire format

use agent_core::error::{AgentError, Result};
use agent_core::message::{Message, Role};
use agent_core::provider::{ChatResponse, FinishReason, GenerationOptions, TokenUsage};
use agent_core::tool::{Parameters, ToolCall, ToolSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl<'a> ChatRequest<'a> {
    pub fn new(
        model: &'a str,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
        stream: bool,
    ) -> Self {
        Self {
            model,
            messages: to_wire_messages(messages),
            tools: to_wire_tools(tools),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: WireFunctionCall,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: WireFunction,
}

#[derive(Debug, Serialize)]
pub struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: WireMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One `data:` payload of a streamed completion
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Fragment of a tool call; `id` and `name` arrive only on some fragments
#[derive(Debug, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

pub fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages.iter().map(to_wire_message).collect()
}

fn to_wire_message(message: &Message) -> WireMessage {
    let mut wire = WireMessage {
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    };

    match message.role {
        Role::Tool => {
            wire.tool_call_id = message.tool_call_id.clone();
            wire.name = message.name.clone();
        }
        Role::Assistant if message.has_tool_calls() => {
            wire.tool_calls = Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        kind: function_type(),
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: Value::Object(call.parameters.clone()).to_string(),
                        },
                    })
                    .collect(),
            );
        }
        _ => {}
    }

    wire
}

/// `None` when empty so the field is left out of the request
pub fn to_wire_tools(tools: &[ToolSchema]) -> Option<Vec<WireTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| WireTool {
                kind: "function",
                function: WireFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
    )
}

pub fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("tool_calls" | "function_call") => FinishReason::ToolCalls,
        _ => FinishReason::Unknown,
    }
}

/// Decode a complete argument string; empty means no arguments
pub fn parse_arguments(raw: &str) -> Result<Parameters> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Parameters::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(params)) => Ok(params),
        Ok(other) => Err(AgentError::Protocol(format!(
            "tool arguments must be a JSON object, got {other}"
        ))),
        Err(e) => Err(AgentError::Protocol(format!("tool arguments are not valid JSON: {e}"))),
    }
}

pub fn parse_response(completion: ChatCompletion) -> Result<ChatResponse> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Protocol("response has no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let parameters = parse_arguments(&call.function.arguments)?;
            Ok(ToolCall::new(call.id, call.function.name, parameters))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ChatResponse::new(
        completion.id,
        choice.message.content,
        tool_calls,
        completion.usage.map(TokenUsage::from).unwrap_or_default(),
        finish_reason(choice.finish_reason.as_deref()),
    ))
}
