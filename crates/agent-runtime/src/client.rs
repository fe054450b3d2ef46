//! Provider router
//!
//! Picks a wire protocol once, at construction, and forwards the two
//! `LlmProvider` calls to it.

use agent_core::{
    error::{AgentError, Result},
    message::Message,
    provider::{ChatResponse, ChunkStream, GenerationOptions, LlmProvider},
    tool::ToolSchema,
};
use async_trait::async_trait;

use crate::anthropic::AnthropicProvider;
use crate::config::{ClientConfig, ProviderKind};
use crate::openai::OpenAiProvider;

/// LLM client backed by the provider named in its configuration
pub struct Client {
    kind: ProviderKind,
    model: String,
    inner: Box<dyn LlmProvider>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let kind = config.provider;
        let model = config.model.clone();
        let inner: Box<dyn LlmProvider> = match kind {
            ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => {
                Box::new(OpenAiProvider::from_config(config)?)
            }
            ProviderKind::Anthropic => Box::new(AnthropicProvider::from_config(config)?),
        };

        tracing::info!(provider = %kind, model = %model, "LLM client ready");
        Ok(Self { kind, model, inner })
    }

    /// Build from `LLM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Build for a provider given by name
    pub fn for_provider(
        name: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let kind = name.parse::<ProviderKind>()?;
        Self::new(ClientConfig::new(kind, model, api_key))
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LlmProvider for Client {
    async fn chat_completion(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChatResponse> {
        self.inner.chat_completion(messages, tools, options).await
    }

    async fn chat_completion_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChunkStream> {
        self.inner.chat_completion_stream(messages, tools, options).await
    }
}
