//! Client configuration
//!
//! Selects a wire protocol and carries the credentials needed to reach it.
//! Environment variables:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `LLM_PROVIDER` | `openai`, `openai_compatible` or `anthropic` (inferred from the model when unset) |
//! | `LLM_MODEL` | Model id, required |
//! | `LLM_API_KEY` | API key; falls back to `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` |
//! | `LLM_BASE_URL` | Alternate base URL, required for `openai_compatible` |
//! | `LLM_TIMEOUT_SECS` | Default per-request timeout |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use agent_core::error::{AgentError, Result};
use secrecy::SecretString;
use url::Url;

const SUPPORTED_PROVIDERS: &str = "openai, openai_compatible, anthropic";

/// Wire protocol family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// api.openai.com
    OpenAi,
    /// Any server speaking the OpenAI chat completions protocol at another URL
    OpenAiCompatible,
    /// Anthropic Messages API
    Anthropic,
}

impl ProviderKind {
    /// Guess the provider from a model id
    pub fn for_model(model: &str) -> Self {
        if model.trim().to_ascii_lowercase().starts_with("claude") {
            ProviderKind::Anthropic
        } else {
            ProviderKind::OpenAi
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    fn api_key_fallback(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "openai_compatible" | "openai-compatible" => Ok(ProviderKind::OpenAiCompatible),
            "anthropic" => Ok(ProviderKind::Anthropic),
            _ => Err(AgentError::UnsupportedProvider {
                name: s.to_string(),
                supported: SUPPORTED_PROVIDERS.into(),
            }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to build a [`crate::Client`]
#[derive(Debug)]
pub struct ClientConfig {
    pub provider: ProviderKind,

    pub model: String,

    /// Sent as a bearer token or `x-api-key`; an empty key sends no auth header
    pub api_key: SecretString,

    /// Overrides the provider's default base URL
    pub base_url: Option<Url>,

    /// Default per-request timeout, used when a call carries none
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(
        provider: ProviderKind,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: SecretString::from(api_key.into()),
            base_url: None,
            timeout: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Load from `LLM_*` environment variables
    pub fn from_env() -> Result<Self> {
        let model = std::env::var("LLM_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| AgentError::Config("LLM_MODEL is not set".into()))?;

        let provider = match std::env::var("LLM_PROVIDER") {
            Ok(name) if !name.trim().is_empty() => name.parse()?,
            _ => ProviderKind::for_model(&model),
        };

        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var(provider.api_key_fallback()))
            .ok();
        let api_key = match (api_key, provider) {
            (Some(key), _) => key,
            // Local OpenAI-compatible servers commonly run without auth.
            (None, ProviderKind::OpenAiCompatible) => String::new(),
            (None, _) => {
                return Err(AgentError::Config(format!(
                    "no API key for {provider}: set LLM_API_KEY or {}",
                    provider.api_key_fallback()
                )))
            }
        };

        let mut config = Self::new(provider, model, api_key);

        if let Ok(raw) = std::env::var("LLM_BASE_URL") {
            let url = Url::parse(raw.trim())
                .map_err(|e| AgentError::Config(format!("LLM_BASE_URL '{raw}' is invalid: {e}")))?;
            config.base_url = Some(url);
        }
        if let Ok(raw) = std::env::var("LLM_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                AgentError::Config(format!("LLM_TIMEOUT_SECS must be an integer, got '{raw}'"))
            })?;
            config.timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check combinations the router cannot serve
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(AgentError::Config("model must not be empty".into()));
        }
        if self.provider == ProviderKind::OpenAiCompatible && self.base_url.is_none() {
            return Err(AgentError::Config(
                "openai_compatible requires a base URL (LLM_BASE_URL)".into(),
            ));
        }
        Ok(())
    }
}
