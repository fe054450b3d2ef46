//! Anthropic LLM Provider
//!
//! Implementation of `LlmProvider` for the Messages API.

mod stream;
pub mod wire;

pub use stream::EventNormalizer;

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::Message,
    provider::{ChatResponse, ChunkStream, GenerationOptions, LlmProvider},
    tool::ToolSchema,
};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::config::{ClientConfig, ProviderKind};
use crate::http;

/// Default Anthropic API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

const PROVIDER: &str = "anthropic";

/// Anthropic Messages API provider
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: Url,
    api_key: SecretString,
    model: String,
    timeout: Option<Duration>,
}

impl AnthropicProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::from_config(ClientConfig::new(ProviderKind::Anthropic, model, api_key))
    }

    /// Create from configuration; `base_url` falls back to api.anthropic.com
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let base_url = match config.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL)
                .map_err(|e| AgentError::Config(format!("invalid default base URL: {e}")))?,
        };

        Ok(Self {
            client: http::build_client(config.timeout)?,
            base_url,
            api_key: config.api_key,
            model: config.model,
            timeout: config.timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn messages_url(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/messages")
    }

    fn request(
        &self,
        body: &wire::MessagesRequest<'_>,
        timeout: Option<Duration>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.messages_url())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        let key = self.api_key.expose_secret();
        if !key.is_empty() {
            builder = builder.header("x-api-key", key);
        }
        http::with_timeout(builder, timeout)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat_completion(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChatResponse> {
        let body = wire::MessagesRequest::new(&self.model, messages, tools, options, false)?;
        let timeout = options.timeout.or(self.timeout);

        tracing::debug!(
            provider = PROVIDER,
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending messages request"
        );

        let response = http::send(self.request(&body, timeout), PROVIDER, timeout).await?;
        let decoded: wire::MessagesResponse = http::decode_json(response, PROVIDER, timeout).await?;

        wire::parse_response(decoded)
    }

    async fn chat_completion_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChunkStream> {
        let body = wire::MessagesRequest::new(&self.model, messages, tools, options, true)?;
        let timeout = options.timeout.or(self.timeout);

        tracing::debug!(
            provider = PROVIDER,
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending streamed messages request"
        );

        let response = http::send(self.request(&body, timeout), PROVIDER, timeout).await?;
        let mut events = Box::pin(response.bytes_stream().eventsource());

        Ok(Box::pin(async_stream::stream! {
            let mut normalizer = EventNormalizer::new();

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        for chunk in normalizer.on_data(&event.data) {
                            yield Ok(chunk);
                        }
                        if normalizer.is_done() {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(http::stream_error(e, PROVIDER, timeout));
                        return;
                    }
                }
            }

            for chunk in normalizer.end_of_stream() {
                yield Ok(chunk);
            }
        }))
    }
}
