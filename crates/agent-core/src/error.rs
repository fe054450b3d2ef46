//! Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
///
/// Tool failures are not represented here: they are classified by
/// [`crate::tool::ToolError`] and fed back to the model as tool messages,
/// never propagated out of the loop.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Network or HTTP failure talking to the provider
    #[error("Provider transport error: {0}")]
    Transport(String),

    /// Provider answered with a body that cannot be mapped onto the shared model
    #[error("Provider protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Maximum iterations reached in the agent loop
    #[error("Maximum iterations ({0}) reached")]
    MaxIterations(usize),

    /// Wall-clock budget for the loop (or a single call) is exhausted
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Outgoing history cannot be expressed in the provider's wire format
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider name not recognised by the router
    #[error("Unsupported provider '{name}' (supported: {supported})")]
    UnsupportedProvider { name: String, supported: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Thread persistence error
    #[error("Thread error: {0}")]
    Thread(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

}

impl AgentError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transport(_) | AgentError::RateLimited(_))
    }

    /// Stable machine-readable code, so callers can map errors onto statuses
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Transport(_) => "provider_transport",
            AgentError::Protocol(_) => "provider_protocol",
            AgentError::Auth(_) => "provider_auth",
            AgentError::RateLimited(_) => "rate_limited",
            AgentError::MaxIterations(_) => "max_iterations_exceeded",
            AgentError::Timeout(_) => "timeout",
            AgentError::InvalidRequest(_) => "invalid_request",
            AgentError::UnsupportedProvider { .. } => "unsupported_provider",
            AgentError::Config(_) => "config",
            AgentError::Thread(_) => "thread",
            AgentError::Json(_) => "json",
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Transport(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            AgentError::Protocol(_) => "The AI service returned an unexpected response.".into(),
            AgentError::MaxIterations(_) => {
                "The request took too many steps to process. Please try a simpler query.".into()
            }
            AgentError::Timeout(_) => "The request took too long to process.".into(),
            AgentError::RateLimited(_) => {
                "You've made too many requests. Please wait a moment.".into()
            }
            AgentError::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl AgentError {
    /// Message without the variant prefix
    pub fn detail(&self) -> String {
        match self {
            AgentError::Transport(d)
            | AgentError::Protocol(d)
            | AgentError::Auth(d)
            | AgentError::RateLimited(d)
            | AgentError::InvalidRequest(d)
            | AgentError::Config(d)
            | AgentError::Thread(d) => d.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild a provider error from a streamed `error` chunk
    ///
    /// Unrecognised kinds are treated as transport failures.
    pub fn from_stream(kind: &str, message: String) -> Self {
        match kind {
            "provider_protocol" => AgentError::Protocol(message),
            "provider_auth" => AgentError::Auth(message),
            "rate_limited" => AgentError::RateLimited(message),
            "invalid_request" => AgentError::InvalidRequest(message),
            _ => AgentError::Transport(message),
        }
    }
}
