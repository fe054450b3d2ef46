//! Anthropic Messages API wire format

use agent_core::error::{AgentError, Result};
use agent_core::message::{Message, Role};
use agent_core::provider::{ChatResponse, FinishReason, GenerationOptions, TokenUsage};
use agent_core::tool::{Parameters, ToolCall, ToolSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct MessagesRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl<'a> MessagesRequest<'a> {
    pub fn new(
        model: &'a str,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
        stream: bool,
    ) -> Result<Self> {
        let (system, messages) = to_wire_messages(messages)?;
        Ok(Self {
            model,
            messages,
            system,
            tools: to_wire_tools(tools),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl WireMessage {
    fn new(role: &str, content: Vec<ContentBlock>) -> Self {
        Self {
            role: role.to_string(),
            content,
        }
    }

    fn is_tool_results(&self) -> bool {
        self.role == "user"
            && !self.content.is_empty()
            && self
                .content
                .iter()
                .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
pub struct WireTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage::new(usage.input_tokens, usage.output_tokens)
    }
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: Vec<ResponseBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Split out the system prompt and convert the rest of the history
///
/// System messages are joined with a blank line. Tool results become
/// `tool_result` blocks on a user turn; consecutive results share one turn.
pub fn to_wire_messages(messages: &[Message]) -> Result<(Option<String>, Vec<WireMessage>)> {
    let mut system = Vec::new();
    let mut out: Vec<WireMessage> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => system.push(message.text()),
            Role::User => out.push(WireMessage::new(
                "user",
                vec![ContentBlock::Text {
                    text: message.text().to_string(),
                }],
            )),
            Role::Assistant => {
                let blocks = assistant_blocks(message)?;
                if blocks.is_empty() {
                    tracing::debug!("dropping empty assistant message");
                    continue;
                }
                out.push(WireMessage::new("assistant", blocks));
            }
            Role::Tool => {
                let tool_use_id = message
                    .tool_call_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        AgentError::InvalidRequest("tool message is missing tool_call_id".into())
                    })?;
                let block = ContentBlock::ToolResult {
                    tool_use_id,
                    content: message.text().to_string(),
                };
                match out.last_mut() {
                    Some(last) if last.is_tool_results() => last.content.push(block),
                    _ => out.push(WireMessage::new("user", vec![block])),
                }
            }
        }
    }

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    Ok((system, out))
}

fn assistant_blocks(message: &Message) -> Result<Vec<ContentBlock>> {
    let mut blocks = Vec::with_capacity(message.tool_calls.len() + 1);

    if !message.text().is_empty() {
        blocks.push(ContentBlock::Text {
            text: message.text().to_string(),
        });
    }

    for call in &message.tool_calls {
        if call.id.is_empty() || call.name.is_empty() {
            return Err(AgentError::InvalidRequest(
                "assistant tool call needs both an id and a name".into(),
            ));
        }
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: Value::Object(call.parameters.clone()),
        });
    }

    Ok(blocks)
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
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect(),
    )
}

pub fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn" | "stop_sequence") => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Unknown,
    }
}

/// `tool_use` input as parameters; null counts as no arguments
pub fn input_parameters(input: Value) -> Result<Parameters> {
    match input {
        Value::Object(params) => Ok(params),
        Value::Null => Ok(Parameters::new()),
        other => Err(AgentError::Protocol(format!(
            "tool_use input must be a JSON object, got {other}"
        ))),
    }
}

pub fn parse_response(response: MessagesResponse) -> Result<ChatResponse> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ResponseBlock::Text { text: part } => text.push_str(&part),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id, name, input_parameters(input)?));
            }
            ResponseBlock::Other => {}
        }
    }

    let content = if text.is_empty() { None } else { Some(text) };
    Ok(ChatResponse::new(
        response.id,
        content,
        tool_calls,
        response.usage.into(),
        stop_reason(response.stop_reason.as_deref()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_system_messages_extracted_and_joined() {
        let (system, messages) = to_wire_messages(&[
            Message::system("You are terse."),
            Message::system("Answer in English."),
            Message::user("hi"),
        ])
        .unwrap();
        assert_eq!(system.as_deref(), Some("You are terse.\n\nAnswer in English."));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn test_tool_results_become_user_blocks() {
        let (_, messages) = to_wire_messages(&[
            Message::user("Orders and returns?"),
            Message::assistant_with_tool_calls(
                Some("Checking both.".into()),
                vec![
                    ToolCall::new("toolu_1", "count_rows", params(json!({"table": "orders"}))),
                    ToolCall::new("toolu_2", "count_rows", params(json!({"table": "returns"}))),
                ],
            ),
            Message::tool_result("toolu_1", "count_rows", r#"{"rows":3}"#),
            Message::tool_result("toolu_2", "count_rows", r#"{"rows":1}"#),
        ])
        .unwrap();

        assert_eq!(messages.len(), 3);
        let value = serde_json::to_value(&messages).unwrap();
        assert_eq!(value[1]["content"][0], json!({"type": "text", "text": "Checking both."}));
        assert_eq!(value[1]["content"][1]["type"], json!("tool_use"));
        assert_eq!(value[1]["content"][1]["input"], json!({"table": "orders"}));
        assert_eq!(value[2]["role"], json!("user"));
        assert_eq!(
            value[2]["content"],
            json!([
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "{\"rows\":3}"},
                {"type": "tool_result", "tool_use_id": "toolu_2", "content": "{\"rows\":1}"}
            ])
        );
    }

    #[test]
    fn test_tool_message_without_id_is_rejected() {
        let mut orphan = Message::tool_result("x", "count_rows", "{}");
        orphan.tool_call_id = None;
        let err = to_wire_messages(&[Message::user("hi"), orphan]).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
    }

    #[test]
    fn test_tool_call_without_name_is_rejected() {
        let calls = vec![ToolCall::new("toolu_1", "", Parameters::new())];
        let message = Message::assistant_with_tool_calls(None, calls);
        assert!(matches!(
            to_wire_messages(&[message]),
            Err(AgentError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_request_omits_empty_tools_and_system() {
        let options = GenerationOptions::new(2.5, 10);
        let request = MessagesRequest::new(
            "claude-3-5-haiku-latest",
            &[Message::user("hi")],
            &[],
            &options,
            false,
        )
        .unwrap();
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["temperature"], json!(2.5));
        assert_eq!(body["max_tokens"], json!(10));
    }

    #[test]
    fn test_tool_calls_round_trip() {
        let calls = vec![
            ToolCall::new("toolu_a", "count_rows", params(json!({"table": "orders"}))),
            ToolCall::new("toolu_b", "query_range", params(json!({"start": "2024-01-01", "n": 3}))),
        ];
        let history = [Message::assistant_with_tool_calls(None, calls.clone())];
        let (_, wire) = to_wire_messages(&history).unwrap();
        let content = serde_json::to_value(&wire[0].content).unwrap();

        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "content": content,
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 40, "output_tokens": 12}
        }))
        .unwrap();
        let parsed = parse_response(response).unwrap();

        assert_eq!(parsed.tool_calls, calls);
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(parsed.usage, TokenUsage::new(40, 12));
    }

    #[test]
    fn test_response_text_concatenated() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_2",
            "content": [
                {"type": "text", "text": "There are "},
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "3 orders."}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 4}
        }))
        .unwrap();
        let parsed = parse_response(response).unwrap();
        assert_eq!(parsed.message.text(), "There are 3 orders.");
        assert_eq!(parsed.usage.total_tokens, 9);
        assert_eq!(parsed.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(stop_reason(Some("stop_sequence")), FinishReason::Stop);
        assert_eq!(stop_reason(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(stop_reason(Some("max_tokens")), FinishReason::Unknown);
    }
}
