//! # agent-core
//!
//! Provider-agnostic tool-calling agent loop with a shared message model and
//! an extensible tool system.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Executor                            │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌─────────────────┐  │
//! │  │  Agent Loop │──│  ToolDispatch    │  │  LlmProvider    │  │
//! │  │  (deadline) │  │  (parallel,      │──│  (Strategy)     │  │
//! │  │             │  │   ordered)       │  │                 │  │
//! │  └─────────────┘  └──────────────────┘  └─────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait lets the loop run against OpenAI-compatible
//! endpoints, Anthropic, or a scripted test double without code changes.

pub mod dispatch;
pub mod error;
pub mod executor;
pub mod message;
pub mod provider;
pub mod thread;
pub mod tool;

pub use dispatch::{dispatch_all, ToolOutcome, INTERNAL_ERROR_MESSAGE};
pub use error::{AgentError, Result};
pub use executor::{Executor, ExecutorBuilder, ExecutorConfig, LoopStream, ToolExecutionResult};
pub use message::{Message, Role};
pub use provider::{
    ChatResponse, ChunkStream, FinishReason, GenerationOptions, LlmProvider, StreamChunk,
    TokenUsage,
};
pub use thread::{KeyedLocks, MemoryThreadStore, Thread, ThreadId, ThreadStore};
pub use tool::{
    BlockingTool, Parameters, Tool, ToolCall, ToolDispatch, ToolError, ToolRegistry, ToolSchema,
    TypedTool,
};
