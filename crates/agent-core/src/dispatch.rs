//! Parallel tool dispatch
//!
//! Runs every tool call of one assistant turn concurrently and turns each
//! outcome into a `tool` message. Failures are classified here and never
//! escape: expected errors reach the model verbatim, anything else is masked.

use std::panic::AssertUnwindSafe;

use futures::future::join_all;
use futures::FutureExt;
use serde_json::{json, Value};

use crate::message::Message;
use crate::provider::StreamChunk;
use crate::tool::{ToolCall, ToolDispatch, ToolError};

/// Message shown to the model in place of an unexpected tool failure
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred while executing the tool.";

/// Result of one tool call, paired with the call it answers
#[derive(Debug)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub result: Result<Value, ToolError>,
}

impl ToolOutcome {
    /// Body of the tool message: the value as JSON, or an error object
    pub fn content(&self) -> String {
        match &self.result {
            Ok(value) => value.to_string(),
            Err(err) if err.is_expected() => json!({
                "error": err.to_string(),
                "error_type": err.error_type(),
            })
            .to_string(),
            Err(err) => json!({
                "error": INTERNAL_ERROR_MESSAGE,
                "error_type": err.error_type(),
            })
            .to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Telemetry chunk for streaming consumers
    pub fn to_chunk(&self) -> StreamChunk {
        StreamChunk::ToolResult {
            tool_call_id: self.call.id.clone(),
            name: self.call.name.clone(),
            content: self.content(),
        }
    }

    pub fn into_message(self) -> Message {
        let content = self.content();
        Message::tool_result(self.call.id, self.call.name, content)
    }
}

/// Execute all `calls` concurrently; outcomes come back in call order
pub async fn dispatch_all(tools: &dyn ToolDispatch, calls: &[ToolCall]) -> Vec<ToolOutcome> {
    tracing::debug!(count = calls.len(), "executing tool batch");

    let results = join_all(calls.iter().map(|call| dispatch_one(tools, call))).await;

    assert_eq!(
        results.len(),
        calls.len(),
        "tool batch returned {} results for {} calls",
        results.len(),
        calls.len()
    );

    calls
        .iter()
        .cloned()
        .zip(results)
        .map(|(call, result)| ToolOutcome { call, result })
        .collect()
}

async fn dispatch_one(tools: &dyn ToolDispatch, call: &ToolCall) -> Result<Value, ToolError> {
    tracing::debug!(tool = %call.name, call_id = %call.id, "executing tool");

    let invocation = tools.execute(&call.name, call.parameters.clone());
    let result = match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ToolError::Internal(anyhow::anyhow!(
            "tool panicked: {}",
            panic_message(&*panic)
        ))),
    };

    match &result {
        Ok(_) => tracing::debug!(tool = %call.name, call_id = %call.id, "tool succeeded"),
        Err(err) if err.is_expected() => tracing::info!(
            tool = %call.name,
            call_id = %call.id,
            error = %err,
            "tool rejected call"
        ),
        Err(err) => tracing::error!(
            tool = %call.name,
            call_id = %call.id,
            error = ?err,
            "tool failed unexpectedly"
        ),
    }

    result
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
