//! Shared HTTP plumbing for the providers

use std::time::Duration;

use agent_core::error::{AgentError, Result};
use eventsource_stream::EventStreamError;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

/// Build the shared HTTP client, with an optional default timeout
pub(crate) fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))
}

/// Send `request` and reject non-2xx responses
///
/// `timeout` is the bound that applied to the request, reported on timeout.
pub(crate) async fn send(
    request: RequestBuilder,
    provider: &'static str,
    timeout: Option<Duration>,
) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(e, provider, timeout))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(provider, status = %status, "provider returned error");
    Err(status_error(status, provider, &body))
}

/// Read the whole body and decode it as JSON
pub(crate) async fn decode_json<T: DeserializeOwned>(
    response: Response,
    provider: &'static str,
    timeout: Option<Duration>,
) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(e, provider, timeout))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AgentError::Protocol(format!("{provider} returned an undecodable body: {e}")))
}

fn status_error(status: StatusCode, provider: &str, body: &str) -> AgentError {
    let detail = format!("{provider} returned {status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(detail),
        _ => AgentError::Transport(detail),
    }
}

pub(crate) fn transport_error(
    err: reqwest::Error,
    provider: &'static str,
    timeout: Option<Duration>,
) -> AgentError {
    if err.is_timeout() {
        tracing::warn!(provider, "request timed out");
        return AgentError::Timeout(timeout.unwrap_or_default());
    }
    tracing::error!(provider, error = %err, "request failed");
    AgentError::Transport(err.to_string())
}

/// Map a failure while reading an SSE body
pub(crate) fn stream_error(
    err: EventStreamError<reqwest::Error>,
    provider: &'static str,
    timeout: Option<Duration>,
) -> AgentError {
    match err {
        EventStreamError::Transport(e) => transport_error(e, provider, timeout),
        other => AgentError::Protocol(format!("{provider} sent a malformed event stream: {other}")),
    }
}

/// Attach the per-call timeout when one is set
pub(crate) fn with_timeout(request: RequestBuilder, timeout: Option<Duration>) -> RequestBuilder {
    match timeout {
        Some(timeout) => request.timeout(timeout),
        None => request,
    }
}
