//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools are registered at runtime and invoked by the agent loop through
//! the [`ToolDispatch`] capability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Decoded tool parameters
pub type Parameters = Map<String, Value>;

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, unique within one assistant turn
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Arguments as key-value pairs
    #[serde(default)]
    pub parameters: Parameters,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// JSON Schema object describing the parameters
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Failure of a single tool invocation
///
/// `UnknownTool` and `Validation` are expected: their message goes back to
/// the model verbatim so it can correct itself. `Internal` is masked.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ToolError {
    pub fn validation(message: impl Into<String>) -> Self {
        ToolError::Validation(message.into())
    }

    /// Whether the message may be shown to the model
    pub fn is_expected(&self) -> bool {
        !matches!(self, ToolError::Internal(_))
    }

    /// Error type reported alongside the message
    pub fn error_type(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "ToolNotFound",
            ToolError::Validation(_) => "ValueError",
            ToolError::Internal(_) => "InternalError",
        }
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given arguments
    async fn execute(&self, params: Parameters) -> Result<Value, ToolError>;

    /// Validate arguments before execution
    fn validate(&self, params: &Parameters) -> Result<(), ToolError> {
        validate_against_schema(&self.schema().input_schema, params)
    }
}

/// Structural check of `params` against a JSON Schema object
///
/// Covers what tool schemas use in practice: `required`, top-level property
/// `type`s and `additionalProperties: false`.
pub fn validate_against_schema(schema: &Value, params: &Parameters) -> Result<(), ToolError> {
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !params.contains_key(name) {
                return Err(ToolError::validation(format!(
                    "Missing required parameter: {name}"
                )));
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in params {
        let Some(property) = properties.and_then(|p| p.get(key)) else {
            if closed {
                return Err(ToolError::validation(format!("Unknown parameter: {key}")));
            }
            continue;
        };

        if let Some(expected) = property.get("type").and_then(Value::as_str) {
            if !matches_json_type(value, expected) {
                return Err(ToolError::validation(format!(
                    "Parameter '{key}' must be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}

fn matches_json_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// A tool with a typed parameter struct
///
/// Parameters are decoded with serde before `check` and `run` see them; use
/// `#[serde(deny_unknown_fields)]` on the struct to reject stray keys.
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Params: DeserializeOwned + Send;

    fn schema(&self) -> ToolSchema;

    /// Semantic validation after decoding
    fn check(&self, _params: &Self::Params) -> Result<(), ToolError> {
        Ok(())
    }

    async fn run(&self, params: Self::Params) -> Result<Value, ToolError>;
}

/// Adapter exposing a [`TypedTool`] as a [`Tool`]
pub struct Typed<T>(pub T);

#[async_trait]
impl<T: TypedTool> Tool for Typed<T> {
    fn schema(&self) -> ToolSchema {
        self.0.schema()
    }

    // Decoding in `execute` is the validation step.
    fn validate(&self, _params: &Parameters) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(&self, params: Parameters) -> Result<Value, ToolError> {
        let params: T::Params = serde_json::from_value(Value::Object(params))
            .map_err(|e| ToolError::validation(format!("Invalid parameters: {e}")))?;
        self.0.check(&params)?;
        self.0.run(params).await
    }
}

type BlockingFn = dyn Fn(Parameters) -> Result<Value, ToolError> + Send + Sync;

/// Synchronous tool body executed on the blocking worker pool
pub struct BlockingTool {
    schema: ToolSchema,
    func: Arc<BlockingFn>,
}

impl BlockingTool {
    pub fn new<F>(schema: ToolSchema, func: F) -> Self
    where
        F: Fn(Parameters) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            schema,
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Tool for BlockingTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, params: Parameters) -> Result<Value, ToolError> {
        let func = Arc::clone(&self.func);
        tokio::task::spawn_blocking(move || func(params))
            .await
            .map_err(|e| ToolError::Internal(anyhow::anyhow!("blocking tool task failed: {e}")))?
    }
}

/// Tool registry capability consumed by the agent loop
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Execute the tool registered under `name`
    async fn execute(&self, name: &str, params: Parameters) -> Result<Value, ToolError>;

    /// Schemas of every registered tool, passed to providers
    fn schemas(&self) -> Vec<ToolSchema>;
}

/// Registry for available tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let schema = tool.schema();
        self.tools.insert(schema.name, Arc::new(tool));
    }

    /// Register a tool with a typed parameter struct
    pub fn register_typed<T: TypedTool>(&mut self, tool: T) {
        self.register(Typed(tool));
    }

    /// Register a shared tool
    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        self.tools.insert(schema.name, tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolDispatch for ToolRegistry {
    async fn execute(&self, name: &str, params: Parameters) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        tool.validate(&params)?;

        tool.execute(params).await
    }

    fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}
