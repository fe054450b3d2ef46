//! # agent-runtime
//!
//! Concrete LLM providers for the agent loop.
//!
//! ## Providers
//!
//! - **OpenAI** (default): chat completions at api.openai.com
//! - **OpenAI-compatible**: the same protocol served at another base URL
//! - **Anthropic**: the Messages API
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::Client;
//!
//! let client = Client::from_env()?;
//! let executor = ExecutorBuilder::new()
//!     .provider(Arc::new(client))
//!     .tools(Arc::new(registry))
//!     .build()?;
//! ```

pub mod anthropic;
pub mod client;
pub mod config;
mod http;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use client::Client;
pub use config::{ClientConfig, ProviderKind};
pub use openai::OpenAiProvider;

// Re-export core types for convenience
pub use agent_core::{
    AgentError, ChatResponse, Executor, ExecutorBuilder, GenerationOptions, LlmProvider, Message,
    Result, Role, StreamChunk, Tool, ToolRegistry,
};
